//! In-process compute device. Programs are built from the same kernel source
//! as the wgpu device: the source is preprocessed and checked for its entry
//! point, then bound to a natively compiled implementation of that entry point.

mod convolve;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use convprop_api::{
    BuildOptions, ConvError, DeviceBackend, DeviceBuffer, DeviceKernel, KernelArg, Result,
};
use log::{debug, trace};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::backend::signature::bind_propagate_args;
use crate::kernel::preprocess::{declares_entry_point, preprocess};
use crate::kernel::{selected_activation, BIASED_DEFINE, PROPAGATE1_KERNEL_NAME};
use convolve::{ConvOperands, HostEntry};

pub const DEFAULT_HOST_MAX_WORKGROUP_SIZE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostBackendOptions {
    pub max_workgroup_size: usize,
    /// Worker threads for work-group execution; `None` uses the global rayon pool.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_threads: Option<usize>,
}

impl Default for HostBackendOptions {
    fn default() -> Self {
        Self {
            max_workgroup_size: DEFAULT_HOST_MAX_WORKGROUP_SIZE,
            num_threads: None,
        }
    }
}

/// Shared f32 storage. Clones refer to the same allocation.
#[derive(Clone)]
pub struct HostBuffer {
    data: Arc<RwLock<Vec<f32>>>,
}

impl HostBuffer {
    pub fn from_vec(data: Vec<f32>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.data.read().clone()
    }

    pub fn fill(&self, value: f32) {
        self.data.write().fill(value);
    }

    pub fn same_storage(&self, other: &HostBuffer) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl DeviceBuffer for HostBuffer {
    fn len(&self) -> usize {
        self.data.read().len()
    }
}

impl std::fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBuffer").field("len", &self.len()).finish()
    }
}

pub struct HostBackend {
    options: HostBackendOptions,
    pool: Option<Arc<rayon::ThreadPool>>,
    builds: AtomicU64,
    dispatches: Arc<AtomicU64>,
}

impl HostBackend {
    pub fn new(options: HostBackendOptions) -> Result<Self> {
        if options.max_workgroup_size == 0 {
            return Err(ConvError::DeviceUnavailable(
                "host max_workgroup_size must be at least 1".to_string(),
            ));
        }
        let pool = match options.num_threads {
            Some(threads) => Some(Arc::new(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|idx| format!("convprop-host-{idx}"))
                    .build()
                    .map_err(|e| ConvError::DeviceUnavailable(e.to_string()))?,
            )),
            None => None,
        };
        debug!(
            "host device ready: max_workgroup_size={} threads={:?}",
            options.max_workgroup_size, options.num_threads
        );
        Ok(Self {
            options,
            pool,
            builds: AtomicU64::new(0),
            dispatches: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn options(&self) -> &HostBackendOptions {
        &self.options
    }

    /// Programs built so far.
    pub fn builds(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }

    /// Dispatches accepted so far, across all kernels of this device.
    pub fn dispatches(&self) -> u64 {
        self.dispatches.load(Ordering::Relaxed)
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self {
            options: HostBackendOptions::default(),
            pool: None,
            builds: AtomicU64::new(0),
            dispatches: Arc::new(AtomicU64::new(0)),
        }
    }
}

pub struct HostKernel {
    name: String,
    options: BuildOptions,
    biased: bool,
    entry: HostEntry,
    max_workgroup_size: usize,
    pool: Option<Arc<rayon::ThreadPool>>,
    dispatches: Arc<AtomicU64>,
}

impl HostKernel {
    pub fn is_biased(&self) -> bool {
        self.biased
    }

    fn buffer_inputs(&self) -> usize {
        if self.biased {
            3
        } else {
            2
        }
    }

    fn fail(&self, message: impl Into<String>) -> ConvError {
        ConvError::dispatch(&self.name, message)
    }
}

impl DeviceKernel for HostKernel {
    type Buffer = HostBuffer;

    fn name(&self) -> &str {
        &self.name
    }

    fn options(&self) -> &BuildOptions {
        &self.options
    }

    fn run_1d(
        &self,
        args: &[KernelArg<'_, HostBuffer>],
        global_size: usize,
        workgroup_size: usize,
    ) -> Result<()> {
        if workgroup_size == 0 || workgroup_size > self.max_workgroup_size {
            return Err(self.fail(format!(
                "workgroup size {workgroup_size} outside 1..={}",
                self.max_workgroup_size
            )));
        }
        if global_size % workgroup_size != 0 {
            return Err(self.fail(format!(
                "global size {global_size} is not a multiple of workgroup size {workgroup_size}"
            )));
        }

        let bound = bind_propagate_args(args, self.buffer_inputs()).map_err(|m| self.fail(m))?;
        let output = bound.output;
        if bound.inputs.iter().any(|input| input.same_storage(output)) {
            return Err(self.fail("results buffer aliases an input buffer"));
        }

        let guards: Vec<_> = bound.inputs.iter().map(|buf| buf.data.read()).collect();
        let ops = ConvOperands {
            geometry: bound.geometry,
            images: &guards[0],
            filters: &guards[1],
            biases: guards.get(2).map(|g| g.as_slice()).unwrap_or(&[]),
        };

        let _span = tracing::debug_span!(
            "host_dispatch",
            kernel = %self.name,
            global_size,
            workgroup_size
        )
        .entered();
        // The write guard is !Send; only the slice crosses into the pool.
        let mut guard = output.data.write();
        let results: &mut [f32] = &mut guard;
        let entry = self.entry;
        let outcome = match &self.pool {
            Some(pool) => pool.install(|| entry(&ops, results, global_size, workgroup_size)),
            None => entry(&ops, results, global_size, workgroup_size),
        };
        outcome.map_err(|m| self.fail(m))?;

        self.dispatches.fetch_add(1, Ordering::Relaxed);
        trace!(
            "{}: ran {} work-items in groups of {}",
            self.name,
            global_size,
            workgroup_size
        );
        Ok(())
    }
}

impl DeviceBackend for HostBackend {
    type Buffer = HostBuffer;
    type Kernel = HostKernel;

    fn build_kernel(
        &self,
        source: &str,
        kernel_name: &str,
        options: &str,
        source_label: &str,
    ) -> Result<HostKernel> {
        let parsed = BuildOptions::parse(options).map_err(|e| match e {
            ConvError::DeviceBuild { message, .. } => {
                ConvError::build(kernel_name, options, message)
            }
            other => other,
        })?;
        let text = preprocess(source, &parsed, kernel_name, source_label)?;
        if !declares_entry_point(&text, kernel_name) {
            return Err(ConvError::build(
                kernel_name,
                options,
                format!("{source_label}: entry point not found"),
            ));
        }
        if kernel_name != PROPAGATE1_KERNEL_NAME {
            return Err(ConvError::build(
                kernel_name,
                options,
                "no native implementation for this entry point on the host device",
            ));
        }
        let activation =
            selected_activation(&parsed).map_err(|m| ConvError::build(kernel_name, options, m))?;
        let biased = parsed.is_defined(BIASED_DEFINE);

        self.builds.fetch_add(1, Ordering::Relaxed);
        debug!("host build {kernel_name} [{parsed}] from {source_label}");
        Ok(HostKernel {
            name: kernel_name.to_string(),
            options: parsed,
            biased,
            entry: convolve::specialize(activation, biased),
            max_workgroup_size: self.options.max_workgroup_size,
            pool: self.pool.clone(),
            dispatches: Arc::clone(&self.dispatches),
        })
    }

    fn max_workgroup_size(&self) -> usize {
        self.options.max_workgroup_size
    }

    fn finish(&self) -> Result<()> {
        // Dispatches complete before run_1d returns.
        Ok(())
    }

    fn upload(&self, data: &[f32], _label: &str) -> Result<HostBuffer> {
        Ok(HostBuffer::from_vec(data.to_vec()))
    }

    fn create_buffer(&self, len: usize, _label: &str) -> Result<HostBuffer> {
        Ok(HostBuffer::from_vec(vec![0.0; len]))
    }

    fn download(&self, buffer: &HostBuffer) -> Result<Vec<f32>> {
        Ok(buffer.to_vec())
    }

    fn device_info(&self) -> String {
        let threads = match &self.pool {
            Some(pool) => pool.current_num_threads(),
            None => rayon::current_num_threads(),
        };
        format!(
            "host (in-process) max_workgroup_size={} threads={threads}",
            self.options.max_workgroup_size
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{propagate1_build_options, PROPAGATE1_SOURCE, PROPAGATE1_SOURCE_LABEL};
    use convprop_api::ActivationFunction;

    fn build(backend: &HostBackend, options: &str) -> Result<HostKernel> {
        backend.build_kernel(
            PROPAGATE1_SOURCE,
            PROPAGATE1_KERNEL_NAME,
            options,
            PROPAGATE1_SOURCE_LABEL,
        )
    }

    #[test]
    fn build_selects_variant_from_options() {
        let backend = HostBackend::default();
        let kernel = build(
            &backend,
            &propagate1_build_options(ActivationFunction::Relu, true).to_string(),
        )
        .unwrap();
        assert!(kernel.is_biased());
        assert_eq!(kernel.name(), PROPAGATE1_KERNEL_NAME);
        assert!(kernel.options().is_defined("RELU"));
        assert_eq!(backend.builds(), 1);
    }

    #[test]
    fn build_failures_are_build_errors() {
        let backend = HostBackend::default();
        for options in ["", "-D TANH -D RELU", "-O3"] {
            match build(&backend, options) {
                Err(ConvError::DeviceBuild { kernel, .. }) => {
                    assert_eq!(kernel, PROPAGATE1_KERNEL_NAME)
                }
                other => panic!("{options:?}: {:?}", other.map(|k| k.name().to_string())),
            }
        }
        let missing = backend.build_kernel(PROPAGATE1_SOURCE, "no_such_entry", "-D LINEAR", "x");
        assert!(matches!(missing, Err(ConvError::DeviceBuild { .. })));
        assert_eq!(backend.builds(), 0);
    }

    #[test]
    fn dispatch_validates_signature_and_geometry() {
        let backend = HostBackend::new(HostBackendOptions {
            max_workgroup_size: 4,
            num_threads: Some(2),
        })
        .unwrap();
        let kernel = build(&backend, "-D LINEAR").unwrap();
        let images = backend.upload(&[1.0; 9], "images").unwrap();
        let filters = backend.upload(&[1.0; 4], "filters").unwrap();
        let results = backend.create_buffer(4, "results").unwrap();
        let ints = [1, 1, 1, 3, 2, 0].map(KernelArg::Int);
        let mut args: Vec<KernelArg<'_, HostBuffer>> = ints.to_vec();
        args.push(KernelArg::Input(&images));
        args.push(KernelArg::Input(&filters));
        args.push(KernelArg::Output(&results));

        kernel.run_1d(&args, 4, 4).unwrap();
        assert_eq!(backend.download(&results).unwrap(), [4.0; 4]);
        assert_eq!(backend.dispatches(), 1);

        assert!(kernel.run_1d(&args, 6, 4).is_err());
        assert!(kernel.run_1d(&args, 8, 8).is_err());
        assert!(kernel.run_1d(&args[..8], 4, 4).is_err());

        let mut swapped = args.clone();
        swapped.swap(6, 8);
        assert!(kernel.run_1d(&swapped, 4, 4).is_err());

        let mut aliased = args.clone();
        aliased[8] = KernelArg::Output(&images);
        assert!(matches!(
            kernel.run_1d(&aliased, 4, 4),
            Err(ConvError::DeviceDispatch { .. })
        ));

        let short = backend.upload(&[1.0; 8], "images").unwrap();
        let mut short_args = args.clone();
        short_args[6] = KernelArg::Input(&short);
        assert!(kernel.run_1d(&short_args, 4, 4).is_err());
        assert_eq!(backend.dispatches(), 1);
    }

    #[test]
    fn dedicated_pool_matches_global_pool() {
        let run = |num_threads| {
            let backend = HostBackend::new(HostBackendOptions {
                max_workgroup_size: 8,
                num_threads,
            })
            .unwrap();
            let kernel = build(&backend, "-D RELU -D BIASED").unwrap();
            let images: Vec<f32> = (0..2 * 2 * 25).map(|v| (v % 7) as f32 - 3.0).collect();
            let filters: Vec<f32> = (0..3 * 2 * 9).map(|v| (v % 5) as f32 * 0.25).collect();
            let images = backend.upload(&images, "images").unwrap();
            let filters = backend.upload(&filters, "filters").unwrap();
            let biases = backend.upload(&[0.5, -1.0, 2.0], "biases").unwrap();
            let results = backend.create_buffer(2 * 3 * 9, "results").unwrap();
            let mut args: Vec<KernelArg<'_, HostBuffer>> =
                [2, 2, 3, 5, 3, 0].map(KernelArg::Int).to_vec();
            args.push(KernelArg::Input(&images));
            args.push(KernelArg::Input(&filters));
            args.push(KernelArg::Input(&biases));
            args.push(KernelArg::Output(&results));
            kernel.run_1d(&args, 56, 8).unwrap();
            assert_eq!(backend.dispatches(), 1);
            backend.download(&results).unwrap()
        };
        let baseline = run(None);
        assert!(baseline.iter().any(|v| *v > 0.0));
        for threads in [1, 2, 5] {
            assert_eq!(run(Some(threads)), baseline, "threads={threads}");
        }
    }

    #[test]
    fn buffers_share_storage_across_clones() {
        let buffer = HostBuffer::from_vec(vec![0.0; 3]);
        let alias = buffer.clone();
        alias.fill(2.0);
        assert_eq!(buffer.to_vec(), [2.0; 3]);
        assert!(buffer.same_storage(&alias));
        assert!(!buffer.same_storage(&HostBuffer::from_vec(vec![0.0; 3])));
    }
}
