//! Material records shared with shaders.

use crate::constants::NULL_TEXTURE_ID;

/// Index into the bindless texture array. `0` means "no texture".
pub type TextureId = u32;

/// GPU material record (64 bytes, std430 compatible).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MaterialDescriptor {
    pub base_color_factor: [f32; 4],
    pub emissive_factor: [f32; 3],
    pub metallic_factor: f32,
    pub roughness_factor: f32,
    pub base_color_texture: TextureId,
    pub normal_texture: TextureId,
    pub metallic_roughness_texture: TextureId,
    pub emissive_texture: TextureId,
    pub _padding: [u32; 3],
}

impl Default for MaterialDescriptor {
    fn default() -> Self {
        Self {
            base_color_factor: [1.0; 4],
            emissive_factor: [0.0; 3],
            metallic_factor: 0.0,
            roughness_factor: 1.0,
            base_color_texture: NULL_TEXTURE_ID,
            normal_texture: NULL_TEXTURE_ID,
            metallic_roughness_texture: NULL_TEXTURE_ID,
            emissive_texture: NULL_TEXTURE_ID,
            _padding: [0; 3],
        }
    }
}
