//! Shader module loading.
//!
//! Shaders are consumed as precompiled SPIR-V; nothing here compiles source.

use crate::error::{GpuError, Result};
use ash::vk;
use std::path::Path;

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Reinterpret SPIR-V bytes as words, checking size and magic number.
pub fn spirv_words(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(GpuError::ShaderCompilation(format!(
            "SPIR-V length {} is not a non-zero multiple of 4",
            bytes.len()
        )));
    }

    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    match words[0] {
        SPIRV_MAGIC => Ok(words),
        m if m == SPIRV_MAGIC.swap_bytes() => Ok(words.into_iter().map(u32::swap_bytes).collect()),
        other => Err(GpuError::ShaderCompilation(format!(
            "bad SPIR-V magic number {other:#010x}"
        ))),
    }
}

/// Read a `.spv` file.
pub fn load_spirv(path: impl AsRef<Path>) -> Result<Vec<u32>> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|e| {
        GpuError::ResourceNotFound(format!("shader {}: {e}", path.display()))
    })?;
    spirv_words(&bytes)
}

/// Create a shader module from SPIR-V words.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_shader_module(device: &ash::Device, code: &[u32]) -> Result<vk::ShaderModule> {
    let info = vk::ShaderModuleCreateInfo::default().code(code);
    device
        .create_shader_module(&info, None)
        .map_err(|e| GpuError::ShaderCompilation(e.to_string()))
}

/// Create a pipeline layout.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_pipeline_layout(
    device: &ash::Device,
    set_layouts: &[vk::DescriptorSetLayout],
    push_constant_ranges: &[vk::PushConstantRange],
) -> Result<vk::PipelineLayout> {
    let info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(set_layouts)
        .push_constant_ranges(push_constant_ranges);
    device
        .create_pipeline_layout(&info, None)
        .map_err(|e| GpuError::PipelineCreation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn accepts_little_endian_module() {
        let words = spirv_words(&module(&[SPIRV_MAGIC, 0x0001_0500, 7])).unwrap();
        assert_eq!(words, vec![SPIRV_MAGIC, 0x0001_0500, 7]);
    }

    #[test]
    fn swaps_big_endian_module() {
        let bytes: Vec<u8> = [SPIRV_MAGIC, 7]
            .iter()
            .flat_map(|w| w.to_be_bytes())
            .collect();
        assert_eq!(spirv_words(&bytes).unwrap(), vec![SPIRV_MAGIC, 7]);
    }

    #[test]
    fn rejects_truncated_and_garbage() {
        assert!(spirv_words(&[]).is_err());
        assert!(spirv_words(&[0x03, 0x02, 0x23]).is_err());
        assert!(matches!(
            spirv_words(&module(&[0xDEAD_BEEF])),
            Err(GpuError::ShaderCompilation(_))
        ));
    }

    #[test]
    fn missing_file_is_not_found() {
        assert!(matches!(
            load_spirv("/nonexistent/shader.spv"),
            Err(GpuError::ResourceNotFound(_))
        ));
    }
}
