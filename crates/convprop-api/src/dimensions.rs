use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ConvError, Result};

/// Geometry of one convolutional layer. Boards and filters are square.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerDimensions {
    pub input_planes: usize,
    pub num_filters: usize,
    pub input_board_size: usize,
    pub filter_size: usize,
    /// Pad so the filter may overhang the board edges with implicit zeros,
    /// instead of shrinking the output board.
    #[serde(default)]
    pub pad_zeros: bool,
    #[serde(default)]
    pub biased: bool,
}

impl LayerDimensions {
    pub fn new(
        input_planes: usize,
        num_filters: usize,
        input_board_size: usize,
        filter_size: usize,
    ) -> Self {
        Self {
            input_planes,
            num_filters,
            input_board_size,
            filter_size,
            pad_zeros: false,
            biased: false,
        }
    }

    pub fn pad_zeros(mut self, pad_zeros: bool) -> Self {
        self.pad_zeros = pad_zeros;
        self
    }

    pub fn biased(mut self, biased: bool) -> Self {
        self.biased = biased;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_planes == 0 || self.num_filters == 0 {
            return Err(ConvError::Configuration(format!(
                "input_planes and num_filters must be positive ({self})"
            )));
        }
        if self.input_board_size == 0 || self.filter_size == 0 {
            return Err(ConvError::Configuration(format!(
                "input_board_size and filter_size must be positive ({self})"
            )));
        }
        if self.filter_size > self.input_board_size {
            return Err(ConvError::Configuration(format!(
                "filter_size {} exceeds input_board_size {}",
                self.filter_size, self.input_board_size
            )));
        }
        // Holds by construction once the filter fits the board.
        debug_assert!(self.output_board_size() >= 1);
        Ok(())
    }

    /// 1 when the filter side is even, 0 otherwise.
    pub fn even_padding(&self) -> usize {
        usize::from(self.filter_size % 2 == 0)
    }

    pub fn half_filter_size(&self) -> usize {
        self.filter_size >> 1
    }

    pub fn output_board_size(&self) -> usize {
        if self.pad_zeros {
            self.input_board_size + self.even_padding()
        } else {
            (self.input_board_size + 1).saturating_sub(self.filter_size)
        }
    }

    pub fn output_board_size_squared(&self) -> usize {
        let size = self.output_board_size();
        size * size
    }

    pub fn output_cube_size(&self) -> usize {
        self.output_board_size_squared() * self.num_filters
    }

    pub fn input_board_size_squared(&self) -> usize {
        self.input_board_size * self.input_board_size
    }

    pub fn input_cube_size(&self) -> usize {
        self.input_planes * self.input_board_size_squared()
    }

    pub fn filter_size_squared(&self) -> usize {
        self.filter_size * self.filter_size
    }

    pub fn filter_cube_size(&self) -> usize {
        self.input_planes * self.filter_size_squared()
    }

    /// Total weight count across every filter.
    pub fn filters_size(&self) -> usize {
        self.num_filters * self.filter_cube_size()
    }

    pub fn biases_size(&self) -> usize {
        self.num_filters
    }

    pub fn images_len(&self, batch_size: usize) -> usize {
        batch_size * self.input_cube_size()
    }

    pub fn results_len(&self, batch_size: usize) -> usize {
        batch_size * self.output_cube_size()
    }
}

impl fmt::Display for LayerDimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LayerDimensions{{ input_planes={} num_filters={} input_board_size={} \
             filter_size={} pad_zeros={} biased={} output_board_size={} }}",
            self.input_planes,
            self.num_filters,
            self.input_board_size,
            self.filter_size,
            self.pad_zeros,
            self.biased,
            self.output_board_size()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_board_size_closed_form() {
        for board in 1..=9usize {
            for filter in 1..=board {
                let even = usize::from(filter % 2 == 0);
                let unpadded = LayerDimensions::new(2, 3, board, filter);
                assert_eq!(unpadded.output_board_size(), board - filter + 1);
                let padded = unpadded.pad_zeros(true);
                assert_eq!(padded.output_board_size(), board + even);
                assert!(unpadded.validate().is_ok());
                assert!(padded.validate().is_ok());
            }
        }
    }

    #[test]
    fn derived_sizes() {
        let dim = LayerDimensions::new(3, 4, 5, 3).biased(true);
        assert_eq!(dim.half_filter_size(), 1);
        assert_eq!(dim.even_padding(), 0);
        assert_eq!(dim.output_board_size(), 3);
        assert_eq!(dim.output_cube_size(), 36);
        assert_eq!(dim.input_cube_size(), 75);
        assert_eq!(dim.filter_cube_size(), 27);
        assert_eq!(dim.filters_size(), 108);
        assert_eq!(dim.biases_size(), 4);
        assert_eq!(dim.images_len(2), 150);
        assert_eq!(dim.results_len(2), 72);

        let even = LayerDimensions::new(1, 1, 4, 2).pad_zeros(true);
        assert_eq!(even.half_filter_size(), 1);
        assert_eq!(even.even_padding(), 1);
        assert_eq!(even.output_board_size(), 5);
    }

    #[test]
    fn filter_larger_than_board_is_rejected() {
        let dim = LayerDimensions::new(1, 1, 3, 4);
        assert!(matches!(dim.validate(), Err(ConvError::Configuration(_))));
        let padded = dim.pad_zeros(true);
        assert!(matches!(padded.validate(), Err(ConvError::Configuration(_))));
    }

    #[test]
    fn zero_counts_are_rejected() {
        assert!(LayerDimensions::new(0, 1, 3, 1).validate().is_err());
        assert!(LayerDimensions::new(1, 0, 3, 1).validate().is_err());
        assert!(LayerDimensions::new(1, 1, 0, 0).validate().is_err());
        assert!(LayerDimensions::new(1, 1, 3, 0).validate().is_err());
    }

    #[test]
    fn flags_default_when_missing_from_json() {
        let dim: LayerDimensions = serde_json::from_str(
            r#"{"input_planes":1,"num_filters":2,"input_board_size":5,"filter_size":3}"#,
        )
        .unwrap();
        assert!(!dim.pad_zeros);
        assert!(!dim.biased);
        assert_eq!(dim.output_board_size(), 3);
    }
}
