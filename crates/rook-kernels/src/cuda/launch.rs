//! CUDA kernel launcher with PTX compilation and caching.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use cudarc::driver::{CudaDevice, CudaFunction, LaunchConfig};
use parking_lot::Mutex;
use rook_core::DType;

use super::CudaError;

/// Threads per block for flat elementwise launches.
pub const BLOCK_SIZE: usize = 256;

/// Compiled modules per device. Key: (device_idx, module_name)
static LOADED: OnceLock<Mutex<HashSet<(usize, &'static str)>>> = OnceLock::new();

fn loaded_set() -> &'static Mutex<HashSet<(usize, &'static str)>> {
    LOADED.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Compile and load `source` as `module` on the device, once.
///
/// The lock is held across compilation so concurrent first launches from
/// several contexts compile the module only once.
pub fn ensure_module(
    device: &Arc<CudaDevice>,
    device_idx: usize,
    module: &'static str,
    source: &str,
    functions: &[&'static str],
) -> Result<(), CudaError> {
    let mut set = loaded_set().lock();
    if set.contains(&(device_idx, module)) {
        return Ok(());
    }

    let ptx = cudarc::nvrtc::compile_ptx(source).map_err(|e| CudaError::PtxCompile {
        module: module.to_string(),
        msg: e.to_string(),
    })?;
    device
        .load_ptx(ptx, module, functions)
        .map_err(|e| CudaError::ModuleLoad {
            module: module.to_string(),
            msg: e.to_string(),
        })?;
    tracing::debug!(device_idx, module, kernels = functions.len(), "loaded CUDA module");

    set.insert((device_idx, module));
    Ok(())
}

/// Get a kernel function handle, loading the module if needed.
pub fn get_or_load_func(
    device: &Arc<CudaDevice>,
    device_idx: usize,
    module: &'static str,
    source: &str,
    functions: &[&'static str],
    func: &str,
) -> Result<CudaFunction, CudaError> {
    ensure_module(device, device_idx, module, source, functions)?;
    device.get_func(module, func).ok_or_else(|| CudaError::FuncNotFound {
        module: module.to_string(),
        func: func.to_string(),
    })
}

/// Name of the `dtype` instantiation of a kernel.
pub fn typed(base: &str, dtype: DType) -> String {
    format!("{}_{}", base, dtype)
}

/// Name of the `(src, dst)` instantiation of a conversion kernel.
pub fn typed2(base: &str, src: DType, dst: DType) -> String {
    format!("{}_{}_{}", base, src, dst)
}

/// One thread per element.
pub fn grid_1d(n: usize, block_size: usize) -> LaunchConfig {
    let grid = n.div_ceil(block_size).max(1);
    LaunchConfig {
        grid_dim: (grid as u32, 1, 1),
        block_dim: (block_size as u32, 1, 1),
        shared_mem_bytes: 0,
    }
}

/// One block per sample, `threads` threads, `shared_floats` of dynamic
/// shared memory.
pub fn per_sample(n: usize, threads: usize, shared_floats: usize) -> LaunchConfig {
    LaunchConfig {
        grid_dim: (n.max(1) as u32, 1, 1),
        block_dim: (threads.max(1) as u32, 1, 1),
        shared_mem_bytes: (shared_floats * std::mem::size_of::<f32>()) as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_names() {
        assert_eq!(typed("bias_activation", DType::F16), "bias_activation_f16");
        assert_eq!(typed2("convert", DType::F32, DType::F16), "convert_f32_f16");
    }

    #[test]
    fn test_grid_1d_rounds_up() {
        let cfg = grid_1d(257, 256);
        assert_eq!(cfg.grid_dim.0, 2);
        assert_eq!(grid_1d(0, 256).grid_dim.0, 1);
    }
}
