use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Nonlinearity applied to each output sum.
///
/// The variant is fixed when a kernel program is built; it is never selected
/// per element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActivationFunction {
    Tanh,
    ScaledTanh,
    Sigmoid,
    Relu,
    Linear,
}

impl ActivationFunction {
    pub const ALL: [ActivationFunction; 5] = [
        ActivationFunction::Tanh,
        ActivationFunction::ScaledTanh,
        ActivationFunction::Sigmoid,
        ActivationFunction::Relu,
        ActivationFunction::Linear,
    ];

    /// Build define that selects this variant in the kernel source.
    pub fn define_name(self) -> &'static str {
        match self {
            ActivationFunction::Tanh => "TANH",
            ActivationFunction::ScaledTanh => "SCALEDTANH",
            ActivationFunction::Sigmoid => "SIGMOID",
            ActivationFunction::Relu => "RELU",
            ActivationFunction::Linear => "LINEAR",
        }
    }

    pub fn from_define_name(define: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.define_name() == define)
    }

    pub fn name(self) -> &'static str {
        match self {
            ActivationFunction::Tanh => "tanh",
            ActivationFunction::ScaledTanh => "scaledtanh",
            ActivationFunction::Sigmoid => "sigmoid",
            ActivationFunction::Relu => "relu",
            ActivationFunction::Linear => "linear",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "tanh" => Some(ActivationFunction::Tanh),
            "scaledtanh" | "scaled-tanh" | "scaled_tanh" => Some(ActivationFunction::ScaledTanh),
            "sigmoid" => Some(ActivationFunction::Sigmoid),
            "relu" => Some(ActivationFunction::Relu),
            "linear" => Some(ActivationFunction::Linear),
            _ => None,
        }
    }

    /// Host evaluation, single precision, same formulas as the device kernel.
    #[inline(always)]
    pub fn calc(self, x: f32) -> f32 {
        match self {
            ActivationFunction::Tanh => x.tanh(),
            ActivationFunction::ScaledTanh => 1.7159f32 * (0.66667f32 * x).tanh(),
            ActivationFunction::Sigmoid => 1.0f32 / (1.0f32 + (-x).exp()),
            ActivationFunction::Relu => {
                if x > 0.0 {
                    x
                } else {
                    0.0
                }
            }
            ActivationFunction::Linear => x,
        }
    }
}

impl fmt::Display for ActivationFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ActivationFunction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| {
            format!("unknown activation '{s}' (expected tanh|scaledtanh|sigmoid|relu|linear)")
        })
    }
}
