//! Benchmark: batch evaluation throughput, fused vs decomposed.

use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rook_core::{DType, Layout};
use rook_engine::{
    Engine, EngineConfig, ExecutionMode, HeadDims, InputPlane, NetworkTopology, PolicyHead, PositionPlanes, ValueHead,
    WeightSet, INPUT_PLANES,
};

fn positions(n: usize, seed: u64) -> Vec<PositionPlanes> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            (0..INPUT_PLANES)
                .map(|_| InputPlane::new(rng.gen::<u64>() & rng.gen::<u64>(), 1.0))
                .collect()
        })
        .collect()
}

fn bench(engine: &Engine, batch: &[PositionPlanes], iters: usize) -> f64 {
    engine.evaluate(batch).unwrap();
    let start = Instant::now();
    for _ in 0..iters {
        let _ = engine.evaluate(batch).unwrap();
    }
    start.elapsed().as_secs_f64() / iters as f64
}

fn main() {
    let simd = rook_kernels::SimdCapability::detect();
    println!("=== Rook Evaluation Benchmark ===");
    println!("SIMD: {}\n", simd.best_tier());

    let topo = NetworkTopology {
        blocks: 6,
        filters: 64,
        se_ratio: Some(8),
        policy: PolicyHead::Convolution,
        value: ValueHead::Wdl,
        moves_left: true,
    };
    let weights = WeightSet::random(&topo, &HeadDims::default(), 1).unwrap();
    let max_batch = 64;

    println!("{:<12} {:<8} {:>8} {:>12} {:>12}", "Mode", "Layout", "Batch", "ms/batch", "nps");
    println!("{}", "-".repeat(56));

    for mode in [ExecutionMode::Fused, ExecutionMode::Decomposed] {
        for layout in [Layout::Nchw, Layout::Nhwc] {
            let cfg = EngineConfig {
                max_batch_size: max_batch,
                precision: DType::F32,
                layout,
                mode,
                ..EngineConfig::default()
            };
            let engine = Engine::new(cfg, &topo, &weights).unwrap();
            for &n in &[1usize, 8, 32, max_batch] {
                let batch = positions(n, n as u64);
                let iters = (256 / n).max(2);
                let secs = bench(&engine, &batch, iters);
                println!(
                    "{:<12} {:<8} {:>8} {:>12.3} {:>12.0}",
                    format!("{:?}", mode),
                    layout.to_string(),
                    n,
                    secs * 1e3,
                    n as f64 / secs
                );
            }
        }
    }
}
