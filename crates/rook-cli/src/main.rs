use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

use rook_core::{DType, Device, DeviceCaps, Layout};
use rook_engine::{
    Engine, EngineConfig, EvalResult, ExecutionMode, HeadDims, InputPlane, NetworkTopology, PolicyHead,
    PositionPlanes, Value, ValueHead, WeightSet, INPUT_PLANES,
};

#[derive(Parser)]
#[command(
    name = "rook",
    about = "Rook residual-tower inference engine",
    long_about = "Batched policy/value network evaluation on the host or a CUDA device.\n\nConfigure with --config <file.json>, --backend-opts \"max_batch=256,precision=fp16\",\nor the individual flags, which take precedence.",
    version
)]
struct Cli {
    /// Engine configuration as JSON
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Backend option string, e.g. "max_batch=64,layout=nhwc"
    #[arg(long, global = true)]
    backend_opts: Option<String>,
    /// Device: host or cuda:N
    #[arg(long, global = true)]
    device: Option<String>,
    /// Storage precision: fp32 or fp16
    #[arg(long, global = true)]
    precision: Option<String>,
    /// Activation layout: nchw or nhwc
    #[arg(long, global = true)]
    layout: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone, Copy)]
struct NetArgs {
    /// Residual blocks
    #[arg(long, default_value = "6")]
    blocks: usize,
    /// Filters per convolution
    #[arg(long, default_value = "64")]
    filters: usize,
    /// SE ratio; 0 disables squeeze-excitation
    #[arg(long, default_value = "8")]
    se_ratio: usize,
    /// Seed for the random weights
    #[arg(long, default_value = "1")]
    seed: u64,
}

impl NetArgs {
    fn topology(&self) -> NetworkTopology {
        NetworkTopology {
            blocks: self.blocks,
            filters: self.filters,
            se_ratio: (self.se_ratio > 0).then_some(self.se_ratio),
            policy: PolicyHead::Convolution,
            value: ValueHead::Wdl,
            moves_left: true,
        }
    }
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Show device capabilities and host SIMD tier
    Info,
    /// Evaluate a random network at several batch sizes
    Bench {
        #[command(flatten)]
        net: NetArgs,
        /// Batch sizes (comma-separated)
        #[arg(long, default_value = "1,8,32,64")]
        batches: String,
        /// Seconds to spend per batch size
        #[arg(long, default_value = "1.0")]
        seconds: f64,
    },
    /// Compare fused and decomposed execution on a random network
    Check {
        #[command(flatten)]
        net: NetArgs,
        /// Positions to evaluate
        #[arg(long, default_value = "8")]
        positions: usize,
        /// Largest tolerated absolute deviation
        #[arg(long)]
        tolerance: Option<f32>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    match cli.command {
        Commands::Info => cmd_info(&config),
        Commands::Bench { net, batches, seconds } => cmd_bench(config, net, &batches, seconds),
        Commands::Check { net, positions, tolerance } => cmd_check(config, net, positions, tolerance),
    }
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match (&cli.config, &cli.backend_opts) {
        (Some(_), Some(_)) => bail!("--config and --backend-opts are mutually exclusive"),
        (Some(path), None) => EngineConfig::from_json_file(path)?,
        (None, Some(opts)) => EngineConfig::from_backend_options(opts)?,
        (None, None) => EngineConfig::default(),
    };
    if let Some(d) = &cli.device {
        config.device = Device::parse(d).with_context(|| format!("unknown device '{}'", d))?;
    }
    if let Some(p) = &cli.precision {
        config.precision = DType::parse(p).with_context(|| format!("unknown precision '{}'", p))?;
    }
    if let Some(l) = &cli.layout {
        config.layout = Layout::parse(l).with_context(|| format!("unknown layout '{}'", l))?;
    }
    Ok(config)
}

fn cmd_info(config: &EngineConfig) -> Result<()> {
    println!("rook v{}\n", env!("CARGO_PKG_VERSION"));

    println!("Platform");
    println!("  OS:   {}", std::env::consts::OS);
    println!("  Arch: {}", std::env::consts::ARCH);

    let simd = rook_kernels::SimdCapability::detect();
    println!("\nSIMD (tier: {})", simd.best_tier());
    println!("  AVX2: {}", if simd.avx2 { "[x]" } else { "[ ]" });
    println!("  FMA:  {}", if simd.fma { "[x]" } else { "[ ]" });
    println!("  NEON: {}", if simd.neon { "[x]" } else { "[ ]" });

    #[cfg(feature = "cuda")]
    println!("\nCUDA devices: {}", rook_core::cuda::device_count());
    #[cfg(not(feature = "cuda"))]
    println!("\nCUDA: not compiled in (build with --features cuda)");

    let caps = config.effective_caps()?;
    println!("\nDevice {}", config.device);
    print_caps(&caps);

    println!("\nConfiguration");
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

fn print_caps(caps: &DeviceCaps) {
    println!("  residual fusing channels: {}", caps.max_res_block_fusing_channels);
    println!("  residual fusing SE k:     {} (fp16: {})", caps.max_res_block_fusing_se_k, caps.max_res_block_fusing_se_k_fp16);
    println!("  SE fusing channels:       {}", caps.max_se_fusing_channels);
    println!("  SE fusing k:              {}", caps.max_se_fusing_k);
    println!("  vendor convolution:       {}", caps.vendor_convolution);
    println!("  fp16:                     {}", caps.fp16);
}

fn random_positions(n: usize, seed: u64) -> Vec<PositionPlanes> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            (0..INPUT_PLANES)
                .map(|_| InputPlane::new(rng.gen::<u64>() & rng.gen::<u64>(), 1.0))
                .collect()
        })
        .collect()
}

fn build(config: EngineConfig, net: &NetArgs) -> Result<Engine> {
    let topo = net.topology();
    let weights = WeightSet::random(&topo, &HeadDims::default(), net.seed)?;
    Ok(Engine::new(config, &topo, &weights)?)
}

fn cmd_bench(config: EngineConfig, net: NetArgs, batches: &str, seconds: f64) -> Result<()> {
    let sizes = batches
        .split(',')
        .map(|s| s.trim().parse::<usize>().with_context(|| format!("bad batch size '{}'", s)))
        .collect::<Result<Vec<_>>>()?;
    let engine = build(config, &net)?;
    println!(
        "{} blocks x {} filters, {:?} {:?} {}, fused blocks: {}\n",
        net.blocks,
        net.filters,
        engine.config().mode,
        engine.config().precision,
        engine.config().layout,
        engine.fused_blocks()
    );
    println!("{:>8} {:>10} {:>12} {:>12}", "Batch", "Evals", "ms/batch", "nps");
    println!("{}", "-".repeat(46));

    for n in sizes {
        if n > engine.max_batch_size() {
            tracing::warn!(batch = n, max_batch = engine.max_batch_size(), "batch size skipped");
            continue;
        }
        tracing::debug!(batch = n, seconds, "benchmarking");
        let batch = random_positions(n, n as u64);
        engine.evaluate(&batch)?;
        let start = Instant::now();
        let mut evals = 0usize;
        while start.elapsed().as_secs_f64() < seconds {
            engine.evaluate(&batch)?;
            evals += 1;
        }
        let secs = start.elapsed().as_secs_f64() / evals.max(1) as f64;
        println!("{:>8} {:>10} {:>12.3} {:>12.0}", n, evals, secs * 1e3, n as f64 / secs);
    }
    Ok(())
}

fn max_deviation(a: &[EvalResult], b: &[EvalResult]) -> f32 {
    let value = |v: &Value| match *v {
        Value::Scalar(q) => vec![q],
        Value::Wdl(wdl) => wdl.to_vec(),
    };
    a.iter()
        .zip(b)
        .flat_map(|(x, y)| {
            let policy = x.policy.iter().zip(&y.policy).map(|(p, q)| (p - q).abs());
            let values: Vec<f32> = value(&x.value).iter().zip(value(&y.value)).map(|(p, q)| (p - q).abs()).collect();
            let ml = x.moves_left.zip(y.moves_left).map(|(p, q)| (p - q).abs());
            policy.chain(values).chain(ml)
        })
        .fold(0.0, f32::max)
}

fn cmd_check(config: EngineConfig, net: NetArgs, positions: usize, tolerance: Option<f32>) -> Result<()> {
    let tolerance = tolerance.unwrap_or(match config.precision {
        DType::F32 => 1e-3,
        DType::F16 => 5e-2,
    });
    let max_batch = config.max_batch_size;
    let fused = build(
        EngineConfig {
            mode: ExecutionMode::Fused,
            ..config.clone()
        },
        &net,
    )?;
    let reference = build(
        EngineConfig {
            mode: ExecutionMode::Decomposed,
            ..config
        },
        &net,
    )?;

    let inputs = random_positions(positions, net.seed);
    let mut worst = 0.0f32;
    for (i, chunk) in inputs.chunks(max_batch.max(1)).enumerate() {
        let deviation = max_deviation(&fused.evaluate(chunk)?, &reference.evaluate(chunk)?);
        tracing::info!(chunk = i, positions = chunk.len(), deviation, "compared");
        worst = worst.max(deviation);
    }
    println!(
        "{} positions, fused blocks: {}, max deviation {:.3e} (tolerance {:.1e})",
        positions,
        fused.fused_blocks(),
        worst,
        tolerance
    );
    if worst > tolerance {
        bail!("fused and decomposed outputs differ by {:.3e}", worst);
    }
    println!("OK");
    Ok(())
}
