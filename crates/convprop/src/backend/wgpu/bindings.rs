use wgpu::{BindGroupLayoutEntry, BindingType, BufferBindingType, ShaderStages};

pub fn uniform_entry(binding: u32) -> BindGroupLayoutEntry {
    buffer_entry(binding, BufferBindingType::Uniform)
}

pub fn storage_read_entry(binding: u32) -> BindGroupLayoutEntry {
    buffer_entry(binding, BufferBindingType::Storage { read_only: true })
}

pub fn storage_read_write_entry(binding: u32) -> BindGroupLayoutEntry {
    buffer_entry(binding, BufferBindingType::Storage { read_only: false })
}

fn buffer_entry(binding: u32, ty: BufferBindingType) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility: ShaderStages::COMPUTE,
        ty: BindingType::Buffer {
            ty,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Uniform params at 0, `n_inputs` read-only buffers at 1.., then the results
/// buffer.
pub fn propagate_entries(n_inputs: usize) -> Vec<BindGroupLayoutEntry> {
    let mut entries = Vec::with_capacity(n_inputs + 2);
    entries.push(uniform_entry(0));
    for i in 0..n_inputs {
        entries.push(storage_read_entry(i as u32 + 1));
    }
    entries.push(storage_read_write_entry(n_inputs as u32 + 1));
    entries
}

pub fn build_propagate_bgl(device: &wgpu::Device, n_inputs: usize) -> wgpu::BindGroupLayout {
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("convprop-propagate-bgl"),
        entries: &propagate_entries(n_inputs),
    })
}
