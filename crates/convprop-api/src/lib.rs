//! convprop API: value types and collaborator interfaces shared by the
//! forward-propagation dispatcher and the device backends.
//!
//! - `LayerDimensions` and `ActivationFunction` describe a layer.
//! - `DeviceBackend`, `DeviceKernel` and `DeviceBuffer` are the narrow surface a
//!   compute device must offer (program build, positional binding, 1-D dispatch,
//!   synchronisation, buffer transfer).
//! - `TimingSink` receives named checkpoints after each dispatch.

mod activation;
mod device;
mod dimensions;
mod error;
mod timing;

pub use activation::ActivationFunction;
pub use device::{BuildOptions, DeviceBackend, DeviceBuffer, DeviceKernel, KernelArg};
pub use dimensions::LayerDimensions;
pub use error::{ConvError, Result};
pub use timing::{NoopTimingSink, TimingSink};
