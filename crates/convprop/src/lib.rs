//! convprop: forward propagation for 2-D convolutional layers on data-parallel
//! compute devices.
//!
//! - `PropagationDispatcher` builds the `propagate1` kernel once for a layer and
//!   dispatches one work-item per output scalar on every call.
//! - `kernel` holds the device source and the preprocessor that specialises it
//!   per activation and bias setting.
//! - `backend` provides the in-process host device and, with the `wgpu` feature,
//!   a wgpu compute device.
//! - `timer::StatefulTimer` collects the per-stage checkpoints the dispatcher
//!   records.

pub mod backend;
pub mod config;
pub mod kernel;
pub mod launch;
pub mod propagate;
pub mod timer;

pub use convprop_api::{
    ActivationFunction, BuildOptions, ConvError, DeviceBackend, DeviceBuffer, DeviceKernel,
    KernelArg, LayerDimensions, NoopTimingSink, Result, TimingSink,
};
pub use launch::LaunchGeometry;
pub use propagate::{PropagationDispatcher, PROPAGATE_TIMING_LABEL};
pub use timer::{StageTiming, StatefulTimer};

use std::sync::Arc;

use crate::backend::HostBackend;
use crate::config::DeviceConfig;

/// Host device configured from `config.host`.
pub fn host_backend_from_config(config: &DeviceConfig) -> Result<Arc<HostBackend>> {
    HostBackend::new(config.host.clone()).map(Arc::new)
}

/// wgpu device configured from `config.wgpu`; `None` when no adapter is usable.
#[cfg(feature = "wgpu")]
pub fn wgpu_backend_from_config(
    config: &DeviceConfig,
) -> Option<Arc<backend::wgpu::WgpuBackend>> {
    backend::wgpu::try_wgpu_backend(config.wgpu.to_options()).map(Arc::new)
}
