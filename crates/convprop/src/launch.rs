/// Work-item count and grouping for one propagate dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchGeometry {
    /// Work-items that map to a real output scalar.
    pub work_items: usize,
    /// `work_items` rounded up to a whole number of groups.
    pub global_size: usize,
    pub workgroup_size: usize,
}

impl LaunchGeometry {
    /// One work-item per output scalar across the batch. `None` when there is
    /// nothing to compute.
    pub fn for_batch(
        batch_size: usize,
        output_cube_size: usize,
        max_workgroup_size: usize,
    ) -> Option<Self> {
        Self::for_work_items(batch_size * output_cube_size, max_workgroup_size)
    }

    pub fn for_work_items(work_items: usize, max_workgroup_size: usize) -> Option<Self> {
        if work_items == 0 {
            return None;
        }
        let workgroup_size = work_items.min(max_workgroup_size.max(1));
        Some(Self {
            work_items,
            global_size: round_up_to_multiple(work_items, workgroup_size),
            workgroup_size,
        })
    }

    pub fn num_workgroups(&self) -> usize {
        self.global_size / self.workgroup_size
    }

    /// Work-items launched only to fill the last group.
    pub fn over_allocated(&self) -> usize {
        self.global_size - self.work_items
    }
}

pub fn round_up_to_multiple(value: usize, mult: usize) -> usize {
    if mult <= 1 {
        return value;
    }
    value.div_ceil(mult) * mult
}
