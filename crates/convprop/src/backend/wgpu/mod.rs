pub mod bindings;
pub mod dispatch;
pub mod params;
pub mod provider;

use log::warn;

pub use provider::{WgpuBackend, WgpuBackendOptions, WgpuBuffer, WgpuKernel};

/// Create a wgpu device, or `None` (with a warning) when no adapter is usable.
pub fn try_wgpu_backend(opts: WgpuBackendOptions) -> Option<WgpuBackend> {
    match WgpuBackend::new(opts) {
        Ok(backend) => Some(backend),
        Err(e) => {
            warn!("convprop: wgpu backend initialization failed: {e}");
            None
        }
    }
}
