//! Argument binding for `convolve_imagecubes_float2`, shared by every device:
//! six ints, the read-only buffers, then the results buffer.

use convprop_api::{DeviceBuffer, KernelArg};

use crate::kernel::PROPAGATE1_SCALAR_ARGS;

/// The six scalar kernel arguments, in declared order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ConvGeometry {
    pub num_examples: isize,
    pub num_input_planes: isize,
    pub num_filters: isize,
    pub input_board_size: isize,
    pub filter_size: isize,
    pub pad_zeros: bool,
}

impl ConvGeometry {
    pub fn from_args(ints: &[i32; PROPAGATE1_SCALAR_ARGS]) -> Result<Self, String> {
        let [
            num_examples,
            num_input_planes,
            num_filters,
            input_board_size,
            filter_size,
            pad_zeros,
        ] = *ints;
        if num_examples < 0 {
            return Err(format!("numExamples must be non-negative, got {num_examples}"));
        }
        if num_input_planes <= 0 || num_filters <= 0 || input_board_size <= 0 || filter_size <= 0 {
            return Err(format!(
                "geometry arguments must be positive (planes={num_input_planes} \
                 filters={num_filters} board={input_board_size} filter={filter_size})"
            ));
        }
        if filter_size > input_board_size {
            return Err(format!(
                "filterSize {filter_size} exceeds inputBoardSize {input_board_size}"
            ));
        }
        Ok(Self {
            num_examples: num_examples as isize,
            num_input_planes: num_input_planes as isize,
            num_filters: num_filters as isize,
            input_board_size: input_board_size as isize,
            filter_size: filter_size as isize,
            pad_zeros: pad_zeros != 0,
        })
    }

    pub fn even_padding(&self) -> isize {
        isize::from(self.filter_size % 2 == 0)
    }

    pub fn output_board_size(&self) -> isize {
        if self.pad_zeros {
            self.input_board_size + self.even_padding()
        } else {
            self.input_board_size - self.filter_size + 1
        }
    }

    pub fn images_len(&self) -> usize {
        (self.num_examples * self.num_input_planes * self.input_board_size * self.input_board_size)
            as usize
    }

    pub fn filters_len(&self) -> usize {
        (self.num_filters * self.num_input_planes * self.filter_size * self.filter_size) as usize
    }

    pub fn biases_len(&self) -> usize {
        self.num_filters as usize
    }

    pub fn results_len(&self) -> usize {
        let out = self.output_board_size();
        (self.num_examples * self.num_filters * out * out) as usize
    }
}

pub(crate) struct BoundArgs<'a, B> {
    pub ints: [i32; PROPAGATE1_SCALAR_ARGS],
    pub geometry: ConvGeometry,
    /// images, filters and, for biased programs, biases.
    pub inputs: Vec<&'a B>,
    pub output: &'a B,
}

/// Match `args` against the kernel signature with `n_inputs` read-only
/// buffers and check every buffer against the sizes the scalars imply.
pub(crate) fn bind_propagate_args<'a, B: DeviceBuffer>(
    args: &[KernelArg<'a, B>],
    n_inputs: usize,
) -> Result<BoundArgs<'a, B>, String> {
    let expected = PROPAGATE1_SCALAR_ARGS + n_inputs + 1;
    if args.len() != expected {
        return Err(format!(
            "expected {expected} arguments, got {}",
            args.len()
        ));
    }
    let mut ints = [0i32; PROPAGATE1_SCALAR_ARGS];
    let mut inputs = Vec::with_capacity(n_inputs);
    let mut output = None;
    for (idx, arg) in args.iter().enumerate() {
        match arg {
            KernelArg::Int(v) if idx < PROPAGATE1_SCALAR_ARGS => ints[idx] = *v,
            KernelArg::Input(buf) if idx >= PROPAGATE1_SCALAR_ARGS && idx + 1 < expected => {
                inputs.push(*buf)
            }
            KernelArg::Output(buf) if idx + 1 == expected => output = Some(*buf),
            other => return Err(format!("argument {idx} has unexpected kind {other:?}")),
        }
    }
    let output = output.ok_or_else(|| "missing output argument".to_string())?;
    let geometry = ConvGeometry::from_args(&ints)?;

    let required = [
        ("images", geometry.images_len()),
        ("filters", geometry.filters_len()),
        ("biases", geometry.biases_len()),
    ];
    for (buf, (what, needed)) in inputs.iter().zip(required) {
        if buf.len() < needed {
            return Err(format!(
                "{what} buffer holds {} floats, kernel reads {needed}",
                buf.len()
            ));
        }
    }
    if output.len() < geometry.results_len() {
        return Err(format!(
            "results buffer holds {} floats, kernel writes {}",
            output.len(),
            geometry.results_len()
        ));
    }

    Ok(BoundArgs {
        ints,
        geometry,
        inputs,
        output,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Len(usize);

    impl DeviceBuffer for Len {
        fn len(&self) -> usize {
            self.0
        }
    }

    fn args<'a>(ints: [i32; 6], buffers: &'a [Len]) -> Vec<KernelArg<'a, Len>> {
        let mut out: Vec<KernelArg<'a, Len>> = ints.into_iter().map(KernelArg::Int).collect();
        let (last, inputs) = buffers.split_last().unwrap();
        out.extend(inputs.iter().map(KernelArg::Input));
        out.push(KernelArg::Output(last));
        out
    }

    #[test]
    fn binds_unbiased_signature() {
        let buffers = [Len(18), Len(8), Len(16)];
        let bound = bind_propagate_args(&args([2, 1, 2, 3, 2, 0], &buffers), 2).unwrap();
        assert_eq!(bound.ints, [2, 1, 2, 3, 2, 0]);
        assert_eq!(bound.inputs.len(), 2);
        assert_eq!(bound.geometry.results_len(), 2 * 2 * 4);
        assert_eq!(bound.output.len(), 16);
    }

    #[test]
    fn biased_signature_checks_bias_length() {
        let buffers = [Len(9), Len(8), Len(1), Len(8)];
        let err = bind_propagate_args(&args([1, 1, 2, 3, 2, 0], &buffers), 3)
            .err()
            .unwrap();
        assert!(err.starts_with("biases buffer"), "{err}");
    }

    #[test]
    fn rejects_short_results_and_wrong_order() {
        let buffers = [Len(9), Len(4), Len(3)];
        assert!(bind_propagate_args(&args([1, 1, 1, 3, 2, 0], &buffers), 2).is_err());

        let buffers = [Len(9), Len(4), Len(4)];
        let mut swapped = args([1, 1, 1, 3, 2, 0], &buffers);
        swapped.swap(0, 6);
        assert!(bind_propagate_args(&swapped, 2).is_err());
        assert!(bind_propagate_args(&swapped[..8], 2).is_err());
    }

    #[test]
    fn geometry_arguments_are_validated() {
        assert!(ConvGeometry::from_args(&[1, 1, 1, 2, 3, 0]).is_err());
        assert!(ConvGeometry::from_args(&[-1, 1, 1, 3, 3, 0]).is_err());
        assert!(ConvGeometry::from_args(&[1, 0, 1, 3, 3, 0]).is_err());
        let padded = ConvGeometry::from_args(&[0, 1, 1, 4, 2, 1]).unwrap();
        assert_eq!(padded.output_board_size(), 5);
        assert_eq!(padded.results_len(), 0);
    }
}
