#![allow(dead_code)]

use convprop::{ActivationFunction, LayerDimensions};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Small deterministic generator for test operands.
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Self(seed ^ 0x9e37_79b9_7f4a_7c15)
    }

    /// Uniform in [-1, 1).
    pub fn next_f32(&mut self) -> f32 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        ((self.0 >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
    }

    pub fn vec(&mut self, len: usize) -> Vec<f32> {
        (0..len).map(|_| self.next_f32()).collect()
    }
}

pub struct Operands {
    pub images: Vec<f32>,
    pub filters: Vec<f32>,
    pub biases: Vec<f32>,
}

pub fn operands(dim: &LayerDimensions, batch: usize, seed: u64) -> Operands {
    let mut rng = Lcg::new(seed);
    Operands {
        images: rng.vec(dim.images_len(batch)),
        filters: rng.vec(dim.filters_size()),
        biases: rng.vec(dim.biases_size()),
    }
}

/// Direct convolution: zero padding of `filter_size >> 1` on the top/left
/// when padded, a valid-only window otherwise.
pub fn reference_propagate(
    dim: &LayerDimensions,
    activation: ActivationFunction,
    batch: usize,
    images: &[f32],
    filters: &[f32],
    biases: Option<&[f32]>,
) -> Vec<f32> {
    let board = dim.input_board_size as isize;
    let fs = dim.filter_size;
    let out_board = dim.output_board_size();
    let shift = if dim.pad_zeros { (fs / 2) as isize } else { 0 };
    let mut out = Vec::with_capacity(dim.results_len(batch));
    for example in 0..batch {
        for filter in 0..dim.num_filters {
            for orow in 0..out_board {
                for ocol in 0..out_board {
                    let mut sum = 0.0f32;
                    for plane in 0..dim.input_planes {
                        let image_base = (example * dim.input_planes + plane)
                            * dim.input_board_size_squared();
                        let filter_base =
                            (filter * dim.input_planes + plane) * dim.filter_size_squared();
                        for u in 0..fs {
                            let irow = orow as isize + u as isize - shift;
                            if irow < 0 || irow >= board {
                                continue;
                            }
                            for v in 0..fs {
                                let icol = ocol as isize + v as isize - shift;
                                if icol < 0 || icol >= board {
                                    continue;
                                }
                                sum += images[image_base + (irow * board + icol) as usize]
                                    * filters[filter_base + u * fs + v];
                            }
                        }
                    }
                    if dim.biased {
                        if let Some(biases) = biases {
                            sum += biases[filter];
                        }
                    }
                    out.push(activation.calc(sum));
                }
            }
        }
    }
    out
}

pub fn assert_close(got: &[f32], want: &[f32], abs_tol: f32, rel_tol: f32) {
    assert_eq!(got.len(), want.len(), "length mismatch");
    for (i, (g, w)) in got.iter().zip(want).enumerate() {
        let diff = (g - w).abs();
        assert!(
            diff <= abs_tol || diff <= rel_tol * w.abs(),
            "mismatch at {i}: got {g}, want {w} (diff {diff})"
        );
    }
}
