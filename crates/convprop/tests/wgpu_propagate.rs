#![cfg(feature = "wgpu")]

mod common;

use std::sync::Arc;

use common::{assert_close, init_logger, operands, reference_propagate};
use convprop::backend::wgpu::{try_wgpu_backend, WgpuBackend, WgpuBackendOptions};
use convprop::kernel::{PROPAGATE1_KERNEL_NAME, PROPAGATE1_SOURCE_LABEL};
use convprop::{
    ActivationFunction, ConvError, DeviceBackend, LayerDimensions, PropagationDispatcher,
};

// Device transcendentals are not bit-exact with the host.
const ABS_TOL: f32 = 1e-4;
const REL_TOL: f32 = 1e-4;

fn gpu() -> Option<Arc<WgpuBackend>> {
    init_logger();
    let backend = try_wgpu_backend(WgpuBackendOptions::default()).map(Arc::new);
    if backend.is_none() {
        eprintln!("skipping: no wgpu adapter available");
    }
    backend
}

#[test]
fn three_by_three_image_two_by_two_ones_filter() {
    let Some(backend) = gpu() else { return };
    let dispatcher = PropagationDispatcher::new(
        backend,
        LayerDimensions::new(1, 1, 3, 2),
        ActivationFunction::Linear,
    )
    .expect("dispatcher");
    let images: Vec<f32> = (0..9).map(|v| v as f32).collect();
    let out = dispatcher
        .propagate_host(1, &images, &[1.0; 4], None)
        .expect("propagate");
    assert_eq!(out, [8.0, 12.0, 20.0, 24.0]);
}

#[test]
fn activations_and_padding_match_reference() {
    let Some(backend) = gpu() else { return };
    for activation in ActivationFunction::ALL {
        let variants = [(3, false, false), (4, true, true), (5, true, false)];
        for (filter_size, pad_zeros, biased) in variants {
            let dim = LayerDimensions::new(3, 4, 9, filter_size)
                .pad_zeros(pad_zeros)
                .biased(biased);
            let batch = 3;
            let ops = operands(&dim, batch, filter_size as u64);
            let dispatcher = PropagationDispatcher::new(Arc::clone(&backend), dim, activation)
                .expect("dispatcher");
            let out = dispatcher
                .propagate_host(batch, &ops.images, &ops.filters, Some(&ops.biases))
                .expect("propagate");
            let want = reference_propagate(
                &dim,
                activation,
                batch,
                &ops.images,
                &ops.filters,
                Some(&ops.biases),
            );
            assert_close(&out, &want, ABS_TOL, REL_TOL);
        }
    }
}

#[test]
fn over_allocated_work_items_never_write() {
    let Some(backend) = gpu() else { return };
    let dim = LayerDimensions::new(2, 3, 11, 3);
    let batch = 5;
    let work_items = dim.results_len(batch);
    assert_ne!(work_items % backend.max_workgroup_size(), 0);

    let ops = operands(&dim, batch, 9);
    let dispatcher =
        PropagationDispatcher::new(Arc::clone(&backend), dim, ActivationFunction::Linear)
            .expect("dispatcher");
    let sentinel = -777.0f32;
    let images = backend.upload(&ops.images, "images").unwrap();
    let filters = backend.upload(&ops.filters, "filters").unwrap();
    let results = backend
        .upload(&vec![sentinel; work_items + 300], "results")
        .unwrap();
    dispatcher
        .propagate(batch, &images, &filters, None, &results)
        .expect("propagate");

    let out = backend.download(&results).unwrap();
    let want = reference_propagate(
        &dim,
        ActivationFunction::Linear,
        batch,
        &ops.images,
        &ops.filters,
        None,
    );
    assert_close(&out[..work_items], &want, ABS_TOL, REL_TOL);
    assert!(out[work_items..].iter().all(|v| *v == sentinel));
}

#[test]
fn folded_grid_covers_every_output_exactly_once() {
    init_logger();
    let options = WgpuBackendOptions {
        max_workgroup_size: Some(64),
        max_groups_per_dim: Some(4),
        ..WgpuBackendOptions::default()
    };
    let Some(backend) = try_wgpu_backend(options).map(Arc::new) else {
        eprintln!("skipping: no wgpu adapter available");
        return;
    };
    assert_eq!(backend.max_workgroup_size(), 64);

    // 2 examples x 3 filters x 12x12 = 864 items: 14 groups folded into 4x4.
    let dim = LayerDimensions::new(2, 3, 11, 4).pad_zeros(true).biased(true);
    let batch = 2;
    let work_items = dim.results_len(batch);
    assert_eq!(work_items, 864);

    let ops = operands(&dim, batch, 41);
    let dispatcher =
        PropagationDispatcher::new(Arc::clone(&backend), dim, ActivationFunction::Tanh)
            .expect("dispatcher");
    let sentinel = -777.0f32;
    let images = backend.upload(&ops.images, "images").unwrap();
    let filters = backend.upload(&ops.filters, "filters").unwrap();
    let biases = backend.upload(&ops.biases, "biases").unwrap();
    let results = backend
        .upload(&vec![sentinel; work_items + 300], "results")
        .unwrap();
    dispatcher
        .propagate(batch, &images, &filters, Some(&biases), &results)
        .expect("propagate");

    let out = backend.download(&results).unwrap();
    let want = reference_propagate(
        &dim,
        ActivationFunction::Tanh,
        batch,
        &ops.images,
        &ops.filters,
        Some(&ops.biases),
    );
    assert_close(&out[..work_items], &want, ABS_TOL, REL_TOL);
    assert!(out[work_items..].iter().all(|v| *v == sentinel));

    // 3 examples need 21 groups, more than a 4x4 grid holds.
    let ops = operands(&dim, 3, 42);
    let err = dispatcher
        .propagate_host(3, &ops.images, &ops.filters, Some(&ops.biases))
        .unwrap_err();
    assert!(matches!(err, ConvError::DeviceDispatch { .. }), "{err}");
}

#[test]
fn invalid_shader_is_a_build_error() {
    let Some(backend) = gpu() else { return };
    let broken = "fn convolve_imagecubes_float2( {\n";
    let result = backend.build_kernel(
        broken,
        PROPAGATE1_KERNEL_NAME,
        "-D LINEAR",
        PROPAGATE1_SOURCE_LABEL,
    );
    assert!(matches!(result, Err(ConvError::DeviceBuild { .. })));
}

#[test]
fn empty_batch_is_a_no_op() {
    let Some(backend) = gpu() else { return };
    let dispatcher = PropagationDispatcher::new(
        backend,
        LayerDimensions::new(2, 2, 5, 3).biased(true),
        ActivationFunction::Relu,
    )
    .expect("dispatcher");
    let out = dispatcher
        .propagate_host(0, &[], &[0.5; 36], Some(&[0.0, 1.0]))
        .expect("propagate");
    assert!(out.is_empty());
}
