//! Native implementation of `convolve_imagecubes_float2` for the in-process
//! device. Activation and bias are type parameters, so each built program is a
//! separate monomorphised function with no per-element branching on either.

use convprop_api::ActivationFunction;
use rayon::prelude::*;

use crate::backend::signature::ConvGeometry;

pub(crate) trait Activation: Send + Sync + 'static {
    const FUNCTION: ActivationFunction;

    #[inline(always)]
    fn apply(x: f32) -> f32 {
        Self::FUNCTION.calc(x)
    }
}

pub(crate) struct Tanh;
pub(crate) struct ScaledTanh;
pub(crate) struct Sigmoid;
pub(crate) struct Relu;
pub(crate) struct Linear;

impl Activation for Tanh {
    const FUNCTION: ActivationFunction = ActivationFunction::Tanh;
}
impl Activation for ScaledTanh {
    const FUNCTION: ActivationFunction = ActivationFunction::ScaledTanh;
}
impl Activation for Sigmoid {
    const FUNCTION: ActivationFunction = ActivationFunction::Sigmoid;
}
impl Activation for Relu {
    const FUNCTION: ActivationFunction = ActivationFunction::Relu;
}
impl Activation for Linear {
    const FUNCTION: ActivationFunction = ActivationFunction::Linear;
}

pub(crate) struct ConvOperands<'a> {
    pub geometry: ConvGeometry,
    pub images: &'a [f32],
    pub filters: &'a [f32],
    /// Empty for unbiased programs.
    pub biases: &'a [f32],
}

/// One work-item: the output scalar for `global_id`, or `None` when the id
/// lies past the last example.
#[inline]
pub(crate) fn work_item<A: Activation, const BIASED: bool>(
    ops: &ConvOperands<'_>,
    global_id: usize,
) -> Option<f32> {
    let g = &ops.geometry;
    let global_id = global_id as isize;

    let even_padding = g.even_padding();
    let input_board_size_squared = g.input_board_size * g.input_board_size;
    let output_board_size = g.output_board_size();
    let output_board_size_squared = output_board_size * output_board_size;
    let filter_size_squared = g.filter_size * g.filter_size;

    let output_board2_id = global_id / output_board_size_squared;
    let example_id = output_board2_id / g.num_filters;
    let filter_id = output_board2_id % g.num_filters;
    if example_id >= g.num_examples {
        return None;
    }

    let local_id = global_id % output_board_size_squared;
    let output_row = local_id / output_board_size;
    let output_col = local_id % output_board_size;

    let half_filter_size = g.filter_size >> 1;
    let (min_m, max_m, min_n, max_n, input_offset) = if g.pad_zeros {
        (
            (-half_filter_size).max(-output_row),
            (half_filter_size - even_padding)
                .min(output_board_size - 1 - output_row - even_padding),
            (-half_filter_size).max(-output_col),
            (half_filter_size - even_padding)
                .min(output_board_size - 1 - output_col - even_padding),
            0,
        )
    } else {
        (
            -half_filter_size,
            half_filter_size - even_padding,
            -half_filter_size,
            half_filter_size - even_padding,
            half_filter_size,
        )
    };

    let input_cube_offset = example_id * g.num_input_planes * input_board_size_squared;
    let filter_cube_offset = filter_id * g.num_input_planes * filter_size_squared;

    let mut sum = 0.0f32;
    for input_plane in 0..g.num_input_planes {
        let input_board_offset = input_cube_offset + input_plane * input_board_size_squared;
        let filter_board_offset = filter_cube_offset + input_plane * filter_size_squared;
        for m in min_m..=max_m {
            let input_row = output_row + m + input_offset;
            let input_row_offset = input_board_offset + input_row * g.input_board_size;
            let filter_row_offset =
                filter_board_offset + (m + half_filter_size) * g.filter_size + half_filter_size;
            for n in min_n..=max_n {
                let input_col = output_col + n + input_offset;
                sum += ops.images[(input_row_offset + input_col) as usize]
                    * ops.filters[(filter_row_offset + n) as usize];
            }
        }
    }

    if BIASED {
        sum += ops.biases[filter_id as usize];
    }
    Some(A::apply(sum))
}

/// Signature shared by every specialised program.
pub(crate) type HostEntry =
    fn(&ConvOperands<'_>, &mut [f32], usize, usize) -> Result<(), String>;

/// Run `global_size` work-items in groups of `workgroup_size`, one rayon task
/// per group.
pub(crate) fn launch<A: Activation, const BIASED: bool>(
    ops: &ConvOperands<'_>,
    results: &mut [f32],
    global_size: usize,
    workgroup_size: usize,
) -> Result<(), String> {
    let covered = results.len().min(global_size);
    results[..covered]
        .par_chunks_mut(workgroup_size)
        .enumerate()
        .for_each(|(group, chunk)| {
            let base = group * workgroup_size;
            for (local, slot) in chunk.iter_mut().enumerate() {
                if let Some(value) = work_item::<A, BIASED>(ops, base + local) {
                    *slot = value;
                }
            }
        });

    // Ids past the end of the results buffer still execute; any that would
    // store a value is an out-of-bounds write.
    let stray = (covered..global_size)
        .into_par_iter()
        .find_any(|&global_id| work_item::<A, BIASED>(ops, global_id).is_some());
    match stray {
        Some(global_id) => Err(format!(
            "work-item {global_id} writes past the end of results ({} elements)",
            results.len()
        )),
        None => Ok(()),
    }
}

/// Pick the program specialised for `activation` and the bias flag.
pub(crate) fn specialize(activation: ActivationFunction, biased: bool) -> HostEntry {
    match (activation, biased) {
        (ActivationFunction::Tanh, false) => launch::<Tanh, false>,
        (ActivationFunction::Tanh, true) => launch::<Tanh, true>,
        (ActivationFunction::ScaledTanh, false) => launch::<ScaledTanh, false>,
        (ActivationFunction::ScaledTanh, true) => launch::<ScaledTanh, true>,
        (ActivationFunction::Sigmoid, false) => launch::<Sigmoid, false>,
        (ActivationFunction::Sigmoid, true) => launch::<Sigmoid, true>,
        (ActivationFunction::Relu, false) => launch::<Relu, false>,
        (ActivationFunction::Relu, true) => launch::<Relu, true>,
        (ActivationFunction::Linear, false) => launch::<Linear, false>,
        (ActivationFunction::Linear, true) => launch::<Linear, true>,
    }
}
