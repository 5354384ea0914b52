//! Shader management module for loading and compiling WGSL shaders.

use crate::error::{Result, SpnError};
use std::borrow::Cow;

/// All shader sources used by the GPU passes.
pub struct ShaderSources {
    /// Hash-grid cell assignment shader
    pub hashgrid: &'static str,
    /// Radix sort of (cellID, index) pairs
    pub hashgrid_sort: &'static str,
}

impl Default for ShaderSources {
    fn default() -> Self {
        Self {
            hashgrid: include_str!("shaders/hashgrid.wgsl"),
            hashgrid_sort: include_str!("shaders/hashgrid_sort.wgsl"),
        }
    }
}

/// Entry points of the radix sort shader, in dispatch order.
pub const SORT_ENTRY_POINTS: &[&str] = &["radix_count", "radix_block_scan", "radix_scatter"];

/// Compiled shader modules ready for use in pipelines.
pub struct CompiledShaders {
    /// Hash-grid cell assignment shader module
    pub hashgrid: wgpu::ShaderModule,
    /// Radix sort shader module
    pub hashgrid_sort: wgpu::ShaderModule,
}

impl CompiledShaders {
    /// Compiles all shaders for the given device.
    ///
    /// # Errors
    /// Returns an error if a shader is missing one of its entry points.
    pub fn compile(device: &wgpu::Device, sources: &ShaderSources) -> Result<Self> {
        validate_shader_entry_points(sources.hashgrid, &["compute_cell_ids"])?;
        validate_shader_entry_points(sources.hashgrid_sort, SORT_ENTRY_POINTS)?;
        let hashgrid = compile_shader(device, "hashgrid", sources.hashgrid);
        let hashgrid_sort = compile_shader(device, "hashgrid_sort", sources.hashgrid_sort);

        Ok(Self {
            hashgrid,
            hashgrid_sort,
        })
    }
}

fn compile_shader(device: &wgpu::Device, name: &str, source: &str) -> wgpu::ShaderModule {
    device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(name),
        source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(source)),
    })
}

/// Validates that a shader source contains expected entry points.
pub fn validate_shader_entry_points(source: &str, expected: &[&str]) -> Result<()> {
    for entry_point in expected {
        if !source.contains(&format!("fn {}", entry_point)) {
            return Err(SpnError::ShaderError(format!(
                "Missing entry point '{}' in shader",
                entry_point
            )));
        }
    }
    Ok(())
}
