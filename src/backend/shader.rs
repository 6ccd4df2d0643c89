// Shader module loading
//
// Shader compilation lives outside the renderer; this module only consumes
// opaque SPIR-V artifacts from disk and wraps them in shader modules.

use anyhow::{Context, Result};
use ash::vk;
use std::path::Path;
use super::VulkanDevice;

/// Create a shader module from SPIR-V bytes.
pub fn create_shader_module(device: &VulkanDevice, code: &[u8]) -> Result<vk::ShaderModule> {
    // SPIR-V is a stream of 4-byte words
    anyhow::ensure!(
        code.len() % 4 == 0 && !code.is_empty(),
        "SPIR-V blob has invalid length {}",
        code.len()
    );

    let code_words = unsafe {
        std::slice::from_raw_parts(code.as_ptr() as *const u32, code.len() / 4)
    };

    let create_info = vk::ShaderModuleCreateInfo::builder().code(code_words);

    unsafe {
        device
            .device
            .create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}

/// Load a compiled SPIR-V artifact and create its shader module.
pub fn load_shader_module<P: AsRef<Path>>(
    device: &VulkanDevice,
    path: P,
) -> Result<vk::ShaderModule> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read shader artifact {:?}", path))?;
    create_shader_module(device, &bytes)
        .with_context(|| format!("Invalid shader artifact {:?}", path))
}
