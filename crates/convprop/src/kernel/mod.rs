//! Device kernel source for forward propagation and its specialisation.

pub mod preprocess;

use convprop_api::{ActivationFunction, BuildOptions};

/// Entry point of the forward-propagation kernel.
pub const PROPAGATE1_KERNEL_NAME: &str = "convolve_imagecubes_float2";

pub const PROPAGATE1_SOURCE_LABEL: &str = "kernels/propagate1.wgsl";

pub const PROPAGATE1_SOURCE: &str = include_str!("../../kernels/propagate1.wgsl");

/// Define added when the layer carries a per-filter bias.
pub const BIASED_DEFINE: &str = "BIASED";

/// Scalar arguments, in declared order, ahead of the buffer arguments.
pub const PROPAGATE1_SCALAR_ARGS: usize = 6;

/// Build options selecting the activation variant and, if set, the bias term.
pub fn propagate1_build_options(activation: ActivationFunction, biased: bool) -> BuildOptions {
    let options = BuildOptions::new().define(activation.define_name());
    if biased {
        options.define(BIASED_DEFINE)
    } else {
        options
    }
}

/// The activation variant selected by `options`; exactly one must be defined.
pub fn selected_activation(options: &BuildOptions) -> Result<ActivationFunction, String> {
    let mut selected = ActivationFunction::ALL
        .into_iter()
        .filter(|f| options.is_defined(f.define_name()));
    match (selected.next(), selected.next()) {
        (Some(f), None) => Ok(f),
        (None, _) => Err(format!(
            "no activation define (expected one of {})",
            ActivationFunction::ALL.map(|f| f.define_name()).join("|")
        )),
        (Some(a), Some(b)) => Err(format!(
            "conflicting activation defines {} and {}",
            a.define_name(),
            b.define_name()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use preprocess::{declares_entry_point, preprocess};

    #[test]
    fn options_string_matches_defines() {
        let opts = propagate1_build_options(ActivationFunction::Relu, true);
        assert_eq!(opts.to_string(), "-D RELU -D BIASED");
        let opts = propagate1_build_options(ActivationFunction::ScaledTanh, false);
        assert_eq!(opts.to_string(), "-D SCALEDTANH");
    }

    #[test]
    fn activation_selection_requires_exactly_one() {
        let opts = BuildOptions::parse("-D SIGMOID -D BIASED").unwrap();
        assert_eq!(selected_activation(&opts), Ok(ActivationFunction::Sigmoid));
        assert!(selected_activation(&BuildOptions::parse("-D BIASED").unwrap()).is_err());
        assert!(selected_activation(&BuildOptions::parse("-D TANH -D RELU").unwrap()).is_err());
    }

    #[test]
    fn source_specialises_per_variant() {
        for activation in ActivationFunction::ALL {
            for biased in [false, true] {
                let opts = propagate1_build_options(activation, biased);
                let text = preprocess(
                    PROPAGATE1_SOURCE,
                    &opts,
                    PROPAGATE1_KERNEL_NAME,
                    PROPAGATE1_SOURCE_LABEL,
                )
                .unwrap();
                assert!(declares_entry_point(&text, PROPAGATE1_KERNEL_NAME));
                assert_eq!(text.matches("fn activation(").count(), 1);
                assert_eq!(text.contains("biases"), biased);
                assert!(text.lines().all(|l| !l.trim_start().starts_with('#')));
            }
        }
    }

    #[test]
    fn buffer_bindings_follow_declared_order() {
        let biased = preprocess(
            PROPAGATE1_SOURCE,
            &propagate1_build_options(ActivationFunction::Linear, true),
            PROPAGATE1_KERNEL_NAME,
            PROPAGATE1_SOURCE_LABEL,
        )
        .unwrap();
        let positions: Vec<usize> = [
            "var<uniform> params:",
            "> images:",
            "> filters:",
            "> biases:",
            "> results:",
        ]
        .into_iter()
        .map(|decl| biased.find(decl).expect(decl))
        .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert!(biased.contains("@binding(3) var<storage, read> biases"));
        assert!(biased.contains("@binding(4) var<storage, read_write> results"));

        let unbiased = preprocess(
            PROPAGATE1_SOURCE,
            &propagate1_build_options(ActivationFunction::Linear, false),
            PROPAGATE1_KERNEL_NAME,
            PROPAGATE1_SOURCE_LABEL,
        )
        .unwrap();
        assert!(unbiased.contains("@binding(3) var<storage, read_write> results"));
        assert!(!unbiased.contains("@binding(4)"));
    }
}
