use bytemuck::{Pod, Zeroable};

use crate::kernel::PROPAGATE1_SCALAR_ARGS;

/// Uniform block at binding 0. Field order is the kernel's scalar argument
/// order, padded to 32 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PropagateParams {
    pub num_examples: i32,
    pub num_input_planes: i32,
    pub num_filters: i32,
    pub input_board_size: i32,
    pub filter_size: i32,
    pub pad_zeros: i32,
    pub _pad0: i32,
    pub _pad1: i32,
}

impl PropagateParams {
    pub fn from_args(ints: &[i32]) -> Option<Self> {
        if ints.len() != PROPAGATE1_SCALAR_ARGS {
            return None;
        }
        Some(Self {
            num_examples: ints[0],
            num_input_planes: ints[1],
            num_filters: ints[2],
            input_board_size: ints[3],
            filter_size: ints[4],
            pad_zeros: ints[5],
            _pad0: 0,
            _pad1: 0,
        })
    }
}
