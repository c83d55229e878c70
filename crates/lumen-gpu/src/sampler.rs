//! Sampler creation.

use crate::error::Result;
use ash::vk;

/// Declarative sampler description.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplerDesc {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: vk::SamplerAddressMode,
    /// `None` disables anisotropic filtering.
    pub max_anisotropy: Option<f32>,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self::linear_repeat()
    }
}

impl SamplerDesc {
    /// Trilinear filtering with repeat addressing, the default for material textures.
    pub const fn linear_repeat() -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
            max_anisotropy: None,
        }
    }

    /// Point sampling clamped to the edge.
    pub const fn nearest_clamp() -> Self {
        Self {
            mag_filter: vk::Filter::NEAREST,
            min_filter: vk::Filter::NEAREST,
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            address_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            max_anisotropy: None,
        }
    }

    pub(crate) fn create_info(&self) -> vk::SamplerCreateInfo<'static> {
        vk::SamplerCreateInfo::default()
            .mag_filter(self.mag_filter)
            .min_filter(self.min_filter)
            .mipmap_mode(self.mipmap_mode)
            .address_mode_u(self.address_mode)
            .address_mode_v(self.address_mode)
            .address_mode_w(self.address_mode)
            .anisotropy_enable(self.max_anisotropy.is_some())
            .max_anisotropy(self.max_anisotropy.unwrap_or(1.0))
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_BLACK)
    }
}

/// Create a sampler.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_sampler(device: &ash::Device, desc: &SamplerDesc) -> Result<vk::Sampler> {
    Ok(device.create_sampler(&desc.create_info(), None)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anisotropy_follows_desc() {
        let info = SamplerDesc::linear_repeat().create_info();
        assert_eq!(info.anisotropy_enable, vk::FALSE);

        let desc = SamplerDesc {
            max_anisotropy: Some(8.0),
            ..SamplerDesc::default()
        };
        let info = desc.create_info();
        assert_eq!(info.anisotropy_enable, vk::TRUE);
        assert_eq!(info.max_anisotropy, 8.0);
    }

    #[test]
    fn address_mode_applies_to_all_axes() {
        let info = SamplerDesc::nearest_clamp().create_info();
        assert_eq!(info.address_mode_u, vk::SamplerAddressMode::CLAMP_TO_EDGE);
        assert_eq!(info.address_mode_v, vk::SamplerAddressMode::CLAMP_TO_EDGE);
        assert_eq!(info.address_mode_w, vk::SamplerAddressMode::CLAMP_TO_EDGE);
        assert_eq!(info.min_filter, vk::Filter::NEAREST);
    }
}
