/// Split `groups` work-groups into an (x, y) grid with each dimension at most
/// `max_per_dim`. The kernel linearises ids as `y * grid_x * wg + x`; ids past
/// the launch fall beyond the last example and exit early.
pub fn workgroup_grid(groups: u32, max_per_dim: u32) -> Option<(u32, u32)> {
    let max_per_dim = max_per_dim.max(1);
    if groups <= max_per_dim {
        return Some((groups, 1));
    }
    let y = groups.div_ceil(max_per_dim);
    if y > max_per_dim {
        return None;
    }
    Some((groups.div_ceil(y), y))
}

pub fn run(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    pipeline: &wgpu::ComputePipeline,
    bind_group: &wgpu::BindGroup,
    grid: (u32, u32),
) -> wgpu::SubmissionIndex {
    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("convprop-propagate-encoder"),
    });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("convprop-propagate-pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        if grid.0 > 0 {
            pass.dispatch_workgroups(grid.0, grid.1, 1);
        }
    }
    queue.submit(Some(encoder.finish()))
}
