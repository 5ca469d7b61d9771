//! Compute devices implementing [`convprop_api::DeviceBackend`].

pub mod host;
pub(crate) mod signature;
#[cfg(feature = "wgpu")]
pub mod wgpu;

pub use host::{HostBackend, HostBackendOptions, HostBuffer, HostKernel};
