use std::sync::Arc;

use convprop_api::{
    ActivationFunction, ConvError, DeviceBackend, DeviceBuffer, DeviceKernel, KernelArg,
    LayerDimensions, Result, TimingSink,
};
use log::{debug, trace};

use crate::kernel::{
    propagate1_build_options, PROPAGATE1_KERNEL_NAME, PROPAGATE1_SOURCE, PROPAGATE1_SOURCE_LABEL,
};
use crate::launch::LaunchGeometry;
use crate::timer::StatefulTimer;

/// Stage label recorded after every dispatch.
pub const PROPAGATE_TIMING_LABEL: &str = "propagate1 after call propagate";

/// Forward propagation for one layer geometry and activation. The kernel is
/// built once in [`PropagationDispatcher::new`] and reused by every call.
pub struct PropagationDispatcher<B: DeviceBackend> {
    backend: Arc<B>,
    dim: LayerDimensions,
    activation: ActivationFunction,
    kernel: B::Kernel,
    timing: Arc<dyn TimingSink>,
}

impl<B: DeviceBackend> PropagationDispatcher<B> {
    pub fn new(
        backend: Arc<B>,
        dim: LayerDimensions,
        activation: ActivationFunction,
    ) -> Result<Self> {
        dim.validate()?;
        let options = propagate1_build_options(activation, dim.biased).to_string();
        let kernel = backend.build_kernel(
            PROPAGATE1_SOURCE,
            PROPAGATE1_KERNEL_NAME,
            &options,
            PROPAGATE1_SOURCE_LABEL,
        )?;
        debug!(
            "propagate1 ready: {dim} activation={activation} options='{options}' on {}",
            backend.device_info()
        );
        Ok(Self {
            backend,
            dim,
            activation,
            kernel,
            timing: Arc::new(GlobalTimer),
        })
    }

    /// Replace the process-wide timer as the destination of stage checkpoints.
    pub fn with_timing_sink(mut self, sink: Arc<dyn TimingSink>) -> Self {
        self.timing = sink;
        self
    }

    pub fn dimensions(&self) -> &LayerDimensions {
        &self.dim
    }

    pub fn activation(&self) -> ActivationFunction {
        self.activation
    }

    pub fn kernel(&self) -> &B::Kernel {
        &self.kernel
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Number of f32 results produced for `batch_size` examples.
    pub fn output_total_size(&self, batch_size: usize) -> usize {
        self.dim.results_len(batch_size)
    }

    /// Compute `results` for `batch_size` examples and block until the
    /// device has finished. `biases` is required for biased layers and ignored
    /// otherwise.
    pub fn propagate(
        &self,
        batch_size: usize,
        images: &B::Buffer,
        weights: &B::Buffer,
        biases: Option<&B::Buffer>,
        results: &B::Buffer,
    ) -> Result<()> {
        self.check_operands(batch_size, images, weights, biases, results)?;

        let Some(launch) = LaunchGeometry::for_batch(
            batch_size,
            self.dim.output_cube_size(),
            self.backend.max_workgroup_size(),
        ) else {
            trace!("propagate1: empty batch, nothing to dispatch");
            return Ok(());
        };

        let mut args: Vec<KernelArg<'_, B::Buffer>> = vec![
            KernelArg::Int(to_kernel_int(batch_size, "batchSize")?),
            KernelArg::Int(to_kernel_int(self.dim.input_planes, "inputPlanes")?),
            KernelArg::Int(to_kernel_int(self.dim.num_filters, "numFilters")?),
            KernelArg::Int(to_kernel_int(self.dim.input_board_size, "inputBoardSize")?),
            KernelArg::Int(to_kernel_int(self.dim.filter_size, "filterSize")?),
            KernelArg::Int(i32::from(self.dim.pad_zeros)),
            KernelArg::Input(images),
            KernelArg::Input(weights),
        ];
        if self.dim.biased {
            if let Some(biases) = biases {
                args.push(KernelArg::Input(biases));
            }
        }
        args.push(KernelArg::Output(results));

        trace!(
            "propagate1: batch={} global={} workgroup={} over_allocated={}",
            batch_size,
            launch.global_size,
            launch.workgroup_size,
            launch.over_allocated()
        );
        self.kernel
            .run_1d(&args, launch.global_size, launch.workgroup_size)?;
        self.backend.finish()?;
        self.timing.time_check(PROPAGATE_TIMING_LABEL);
        Ok(())
    }

    /// Upload host operands, propagate, and read the results back.
    pub fn propagate_host(
        &self,
        batch_size: usize,
        images: &[f32],
        weights: &[f32],
        biases: Option<&[f32]>,
    ) -> Result<Vec<f32>> {
        let images = self.backend.upload(images, "images")?;
        let weights = self.backend.upload(weights, "weights")?;
        let biases = match biases {
            Some(b) if self.dim.biased => Some(self.backend.upload(b, "biases")?),
            _ => None,
        };
        let results = self
            .backend
            .create_buffer(self.output_total_size(batch_size), "results")?;
        self.propagate(batch_size, &images, &weights, biases.as_ref(), &results)?;
        self.backend.download(&results)
    }

    fn check_operands(
        &self,
        batch_size: usize,
        images: &B::Buffer,
        weights: &B::Buffer,
        biases: Option<&B::Buffer>,
        results: &B::Buffer,
    ) -> Result<()> {
        let expect = |what: &str, have: usize, need: usize| {
            if have < need {
                Err(ConvError::InvalidOperand(format!(
                    "{what} holds {have} floats, {need} required for batch {batch_size} of {}",
                    self.dim
                )))
            } else {
                Ok(())
            }
        };
        expect("images", images.len(), self.dim.images_len(batch_size))?;
        expect("weights", weights.len(), self.dim.filters_size())?;
        expect("results", results.len(), self.dim.results_len(batch_size))?;
        if self.dim.biased {
            let biases = biases.ok_or_else(|| {
                ConvError::InvalidOperand("biased layer called without biases".to_string())
            })?;
            expect("biases", biases.len(), self.dim.biases_size())?;
        }
        Ok(())
    }
}

fn to_kernel_int(value: usize, what: &str) -> Result<i32> {
    i32::try_from(value).map_err(|_| {
        ConvError::InvalidOperand(format!("{what} {value} does not fit a kernel int"))
    })
}

/// Forwards checkpoints to [`StatefulTimer::global`].
struct GlobalTimer;

impl TimingSink for GlobalTimer {
    fn time_check(&self, label: &str) {
        StatefulTimer::global().time_check(label);
    }
}
