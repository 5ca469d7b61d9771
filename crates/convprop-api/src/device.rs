use std::fmt;

use crate::error::{ConvError, Result};

/// Device-resident f32 storage handed to kernels by reference.
pub trait DeviceBuffer {
    /// Capacity in f32 elements.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One positional kernel argument. Order in the argument slice is the
/// binding order and must match the kernel's declared parameter order.
pub enum KernelArg<'a, B> {
    Int(i32),
    Input(&'a B),
    Output(&'a B),
}

impl<B> Clone for KernelArg<'_, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B> Copy for KernelArg<'_, B> {}

impl<B> fmt::Debug for KernelArg<'_, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelArg::Int(value) => write!(f, "Int({value})"),
            KernelArg::Input(_) => f.write_str("Input(..)"),
            KernelArg::Output(_) => f.write_str("Output(..)"),
        }
    }
}

/// A compiled program with a single entry point.
pub trait DeviceKernel {
    type Buffer: DeviceBuffer;

    fn name(&self) -> &str;

    fn options(&self) -> &BuildOptions;

    /// Submit a 1-D dispatch of `global_size` work-items in groups of
    /// `workgroup_size`. `global_size` must be a multiple of `workgroup_size`.
    fn run_1d(
        &self,
        args: &[KernelArg<'_, Self::Buffer>],
        global_size: usize,
        workgroup_size: usize,
    ) -> Result<()>;
}

/// Compute device: program builds, dispatch limits, synchronisation and the
/// buffer transfers that the enclosing memory layer normally owns.
pub trait DeviceBackend {
    type Buffer: DeviceBuffer;
    type Kernel: DeviceKernel<Buffer = Self::Buffer>;

    /// Specialise `source` with the preprocessor-style `options` and build the
    /// entry point `kernel_name`. `source_label` names the source in diagnostics.
    fn build_kernel(
        &self,
        source: &str,
        kernel_name: &str,
        options: &str,
        source_label: &str,
    ) -> Result<Self::Kernel>;

    /// Largest work-group the device schedules for a 1-D dispatch.
    fn max_workgroup_size(&self) -> usize;

    /// Block until all submitted work has completed.
    fn finish(&self) -> Result<()>;

    fn upload(&self, data: &[f32], label: &str) -> Result<Self::Buffer>;

    /// Zero-initialised buffer of `len` elements.
    fn create_buffer(&self, len: usize, label: &str) -> Result<Self::Buffer>;

    fn download(&self, buffer: &Self::Buffer) -> Result<Vec<f32>>;

    fn device_info(&self) -> String;
}

/// Parsed `-D NAME` build options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOptions {
    defines: Vec<String>,
}

impl BuildOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts `-D NAME` and `-DNAME` tokens separated by whitespace.
    pub fn parse(options: &str) -> Result<Self> {
        let mut parsed = BuildOptions::new();
        let mut tokens = options.split_whitespace();
        while let Some(token) = tokens.next() {
            let name = match token {
                "-D" => tokens.next().ok_or_else(|| {
                    ConvError::build("", options, "'-D' is missing a define name")
                })?,
                other => other.strip_prefix("-D").filter(|n| !n.is_empty()).ok_or_else(|| {
                    ConvError::build("", options, format!("unsupported build option '{other}'"))
                })?,
            };
            if !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(ConvError::build(
                    "",
                    options,
                    format!("invalid define name '{name}'"),
                ));
            }
            parsed = parsed.define(name);
        }
        Ok(parsed)
    }

    pub fn define(mut self, name: &str) -> Self {
        if !self.is_defined(name) {
            self.defines.push(name.to_string());
        }
        self
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.defines.iter().any(|d| d == name)
    }

    pub fn defines(&self) -> &[String] {
        &self.defines
    }
}

impl fmt::Display for BuildOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, define) in self.defines.iter().enumerate() {
            if idx > 0 {
                f.write_str(" ")?;
            }
            write!(f, "-D {define}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_separated_and_joined_defines() {
        let opts = BuildOptions::parse("-D RELU  -DBIASED").unwrap();
        assert!(opts.is_defined("RELU"));
        assert!(opts.is_defined("BIASED"));
        assert!(!opts.is_defined("TANH"));
        assert_eq!(opts.to_string(), "-D RELU -D BIASED");
    }

    #[test]
    fn empty_options_have_no_defines() {
        let opts = BuildOptions::parse("   ").unwrap();
        assert!(opts.defines().is_empty());
        assert_eq!(opts.to_string(), "");
    }

    #[test]
    fn duplicate_defines_collapse() {
        let opts = BuildOptions::parse("-D TANH -D TANH").unwrap();
        assert_eq!(opts.defines(), &["TANH".to_string()]);
    }

    #[test]
    fn rejects_malformed_options() {
        assert!(matches!(
            BuildOptions::parse("-D"),
            Err(ConvError::DeviceBuild { .. })
        ));
        assert!(BuildOptions::parse("-O3").is_err());
        assert!(BuildOptions::parse("-D BAD-NAME").is_err());
    }
}
