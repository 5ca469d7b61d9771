use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use convprop::backend::HostBackend;
use convprop::config::{
    parse_backend_preference, BackendPreference, ConfigLoader, DeviceConfig, LayerConfig,
};
use convprop::{
    host_backend_from_config, ActivationFunction, DeviceBackend, LayerDimensions,
    PropagationDispatcher, StageTiming, StatefulTimer,
};
use log::info;
use serde::Serialize;

const VALUE_TOLERANCE: f32 = 1e-4;
const VALUE_REL_TOLERANCE: f32 = 1e-4;

#[derive(Serialize)]
struct VerifyReport {
    max_abs_diff: f32,
    mismatches: usize,
    passed: bool,
}

#[derive(Serialize)]
struct ProfileReport {
    backend: String,
    device: String,
    layer: LayerDimensions,
    activation: ActivationFunction,
    batch_size: usize,
    iterations: usize,
    work_items: usize,
    mean_ms: f64,
    min_ms: f64,
    max_ms: f64,
    verify: Option<VerifyReport>,
    timings: Vec<StageTiming>,
}

fn flag_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|pos| args.get(pos + 1))
        .map(String::as_str)
}

fn parse_flag<T: std::str::FromStr>(args: &[String], name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    flag_value(args, name)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| anyhow!("invalid value '{raw}' for {name}: {e}"))
        })
        .transpose()
}

fn print_usage() {
    println!(
        "usage: propagate_profile [--planes N] [--filters N] [--board N] [--filter-size N] \
         [--pad] [--biased] [--activation NAME] [--batch N] [--iterations N] \
         [--backend auto|wgpu|host] [--verify] [--config PATH] [--output PATH] [--sample-config]"
    );
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = std::env::args().skip(1).collect::<Vec<_>>();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }
    if args.iter().any(|a| a == "--sample-config") {
        print!("{}", ConfigLoader::generate_sample_config());
        return Ok(());
    }

    let config = match flag_value(&args, "--config") {
        Some(path) => {
            let mut config = ConfigLoader::load_from_file(&PathBuf::from(path))?;
            ConfigLoader::apply_environment_variables(&mut config)?;
            config
        }
        None => ConfigLoader::load()?,
    };

    let mut layer = config.layer.clone().unwrap_or(LayerConfig {
        dimensions: LayerDimensions::new(32, 32, 19, 5).pad_zeros(true),
        activation: ActivationFunction::Tanh,
        batch_size: 128,
    });
    if let Some(v) = parse_flag(&args, "--planes")? {
        layer.dimensions.input_planes = v;
    }
    if let Some(v) = parse_flag(&args, "--filters")? {
        layer.dimensions.num_filters = v;
    }
    if let Some(v) = parse_flag(&args, "--board")? {
        layer.dimensions.input_board_size = v;
    }
    if let Some(v) = parse_flag(&args, "--filter-size")? {
        layer.dimensions.filter_size = v;
    }
    if args.iter().any(|a| a == "--pad") {
        layer.dimensions.pad_zeros = true;
    }
    if args.iter().any(|a| a == "--biased") {
        layer.dimensions.biased = true;
    }
    if let Some(v) = parse_flag(&args, "--activation")? {
        layer.activation = v;
    }
    if let Some(v) = parse_flag(&args, "--batch")? {
        layer.batch_size = v;
    }
    let iterations: usize = parse_flag(&args, "--iterations")?.unwrap_or(10).max(1);
    let verify = args.iter().any(|a| a == "--verify");
    let output_path = flag_value(&args, "--output")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("propagate_profile.json"));
    let preference = match flag_value(&args, "--backend") {
        Some(raw) => parse_backend_preference(raw)
            .ok_or_else(|| anyhow!("unknown backend '{raw}' (expected auto|wgpu|host)"))?,
        None => config.device.backend,
    };

    StatefulTimer::global().set_enabled(config.timing.enabled);
    StatefulTimer::global().reset();

    let host = host_backend_from_config(&config.device)?;
    let reference = verify.then(|| Arc::clone(&host));

    let report = match preference {
        BackendPreference::Host => profile("host", host, &layer, iterations, reference)?,
        BackendPreference::Wgpu | BackendPreference::Auto => {
            profile_device(preference, &config.device, host, &layer, iterations, reference)?
        }
    };

    if config.timing.dump_on_exit {
        StatefulTimer::global().dump(false);
    }

    let mut file = File::create(&output_path)
        .with_context(|| format!("failed to create {}", output_path.display()))?;
    file.write_all(serde_json::to_string_pretty(&report)?.as_bytes())?;
    info!(
        "{} on {}: mean {:.3} ms over {} iterations; report written to {}",
        report.layer,
        report.device,
        report.mean_ms,
        report.iterations,
        output_path.display()
    );

    if let Some(check) = &report.verify {
        if !check.passed {
            bail!(
                "verification failed: {} mismatches (max abs diff {})",
                check.mismatches,
                check.max_abs_diff
            );
        }
    }
    Ok(())
}

#[cfg(feature = "wgpu")]
fn profile_device(
    preference: BackendPreference,
    device: &DeviceConfig,
    host: Arc<HostBackend>,
    layer: &LayerConfig,
    iterations: usize,
    reference: Option<Arc<HostBackend>>,
) -> Result<ProfileReport> {
    match convprop::wgpu_backend_from_config(device) {
        Some(gpu) => profile("wgpu", gpu, layer, iterations, reference),
        None if preference == BackendPreference::Auto => {
            log::warn!("no usable wgpu adapter; falling back to the host backend");
            profile("host", host, layer, iterations, reference)
        }
        None => bail!("wgpu backend requested but no adapter is available"),
    }
}

#[cfg(not(feature = "wgpu"))]
fn profile_device(
    preference: BackendPreference,
    _device: &DeviceConfig,
    host: Arc<HostBackend>,
    layer: &LayerConfig,
    iterations: usize,
    reference: Option<Arc<HostBackend>>,
) -> Result<ProfileReport> {
    if preference == BackendPreference::Wgpu {
        bail!("wgpu backend requested but built without the 'wgpu' feature");
    }
    profile("host", host, layer, iterations, reference)
}

fn profile<B: DeviceBackend>(
    backend_name: &str,
    backend: Arc<B>,
    layer: &LayerConfig,
    iterations: usize,
    reference: Option<Arc<HostBackend>>,
) -> Result<ProfileReport> {
    let dim = layer.dimensions;
    let batch = layer.batch_size;
    let dispatcher = PropagationDispatcher::new(Arc::clone(&backend), dim, layer.activation)?;
    info!(
        "profiling {dim} activation={} batch={batch} on {}",
        layer.activation,
        backend.device_info()
    );

    let images = synthetic_data(dim.images_len(batch), 0x5eed_0001);
    let weights = synthetic_data(dim.filters_size(), 0x5eed_0002);
    let biases = synthetic_data(dim.biases_size(), 0x5eed_0003);

    let images_buf = backend.upload(&images, "images")?;
    let weights_buf = backend.upload(&weights, "weights")?;
    let biases_buf = if dim.biased {
        Some(backend.upload(&biases, "biases")?)
    } else {
        None
    };
    let results_buf = backend.create_buffer(dispatcher.output_total_size(batch), "results")?;

    let mut samples = Vec::with_capacity(iterations);
    for _ in 0..iterations {
        let t0 = Instant::now();
        dispatcher.propagate(
            batch,
            &images_buf,
            &weights_buf,
            biases_buf.as_ref(),
            &results_buf,
        )?;
        samples.push(t0.elapsed().as_secs_f64() * 1000.0);
    }
    let results = backend.download(&results_buf)?;

    let verify = match reference {
        Some(host) => {
            let expected = PropagationDispatcher::new(host, dim, layer.activation)?
                .propagate_host(batch, &images, &weights, Some(&biases))?;
            Some(compare(&results, &expected)?)
        }
        None => None,
    };

    let mean_ms = samples.iter().sum::<f64>() / samples.len() as f64;
    Ok(ProfileReport {
        backend: backend_name.to_string(),
        device: backend.device_info(),
        layer: dim,
        activation: layer.activation,
        batch_size: batch,
        iterations,
        work_items: dispatcher.output_total_size(batch),
        mean_ms,
        min_ms: samples.iter().copied().fold(f64::INFINITY, f64::min),
        max_ms: samples.iter().copied().fold(0.0, f64::max),
        verify,
        timings: StatefulTimer::global().snapshot(),
    })
}

fn compare(got: &[f32], want: &[f32]) -> Result<VerifyReport> {
    if got.len() != want.len() {
        bail!(
            "result length {} differs from reference {}",
            got.len(),
            want.len()
        );
    }
    let mut max_abs_diff = 0.0f32;
    let mut mismatches = 0;
    for (g, w) in got.iter().zip(want) {
        let diff = (g - w).abs();
        max_abs_diff = max_abs_diff.max(diff);
        if diff > VALUE_TOLERANCE && diff > VALUE_REL_TOLERANCE * w.abs() {
            mismatches += 1;
        }
    }
    Ok(VerifyReport {
        max_abs_diff,
        mismatches,
        passed: mismatches == 0,
    })
}

/// Deterministic values in [-1, 1).
fn synthetic_data(len: usize, seed: u64) -> Vec<f32> {
    let mut state = seed;
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((state >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
        })
        .collect()
}
