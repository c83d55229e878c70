//! Bindless texture storage backed by decoded image files.

use crate::error::Result;
use crate::material::TextureUploader;
use ash::vk;
use lumen_core::TextureId;
use lumen_gpu::{
    create_sampler, upload_rgba8_texture, BindlessTextureTable, DeletionQueue, GpuContext,
    GpuImage, SamplerDesc,
};
use std::path::Path;

/// Decode an image file into tightly packed RGBA8.
pub fn decode_rgba8(path: &Path) -> lumen_core::Result<(u32, u32, Vec<u8>)> {
    if !path.exists() {
        return Err(lumen_core::Error::NotFound(path.display().to_string()));
    }
    let image = image::open(path)
        .map_err(|e| lumen_core::Error::ImageDecode(format!("{}: {e}", path.display())))?
        .to_rgba8();
    let (width, height) = image.dimensions();
    Ok((width, height, image.into_raw()))
}

struct LoadedTexture {
    image: GpuImage,
    view: vk::ImageView,
}

/// GPU textures living in a bindless descriptor array.
///
/// Slot 0 always holds a 1x1 white texture.
pub struct BindlessTextures {
    table: BindlessTextureTable,
    sampler: vk::Sampler,
    textures: Vec<LoadedTexture>,
}

impl BindlessTextures {
    pub fn new(gpu: &GpuContext, table: BindlessTextureTable) -> Result<Self> {
        let sampler = unsafe { create_sampler(gpu.device(), &SamplerDesc::default())? };
        let mut textures = Self {
            table,
            sampler,
            textures: Vec::new(),
        };

        let fallback = textures.upload_pixels(gpu, "fallback_texture", 1, 1, &[255; 4]);
        match fallback.and_then(|loaded| {
            unsafe {
                textures
                    .table
                    .write_fallback(gpu.device(), loaded.view, textures.sampler)?;
            }
            textures.textures.push(loaded);
            Ok(())
        }) {
            Ok(()) => Ok(textures),
            Err(e) => {
                let mut deletion = DeletionQueue::new(0);
                textures.destroy(gpu, &mut deletion);
                deletion.execute(true);
                Err(e)
            }
        }
    }

    fn upload_pixels(
        &self,
        gpu: &GpuContext,
        name: &str,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> Result<LoadedTexture> {
        let image = upload_rgba8_texture(gpu, name, width, height, vk::Format::R8G8B8A8_SRGB, pixels)?;
        match unsafe { image.create_view(gpu.device()) } {
            Ok(view) => Ok(LoadedTexture { image, view }),
            Err(e) => {
                gpu.allocator().lock().destroy_image(image)?;
                Err(e.into())
            }
        }
    }

    /// Decode `path`, upload it and write it into a fresh slot.
    pub fn load(&mut self, gpu: &GpuContext, path: &Path) -> Result<TextureId> {
        let (width, height, pixels) = decode_rgba8(path)?;
        let slot = self.table.allocate_slot()?;
        let name = path.file_name().map_or_else(
            || "texture".to_string(),
            |n| n.to_string_lossy().into_owned(),
        );

        let loaded = self.upload_pixels(gpu, &name, width, height, &pixels)?;
        unsafe {
            self.table.write(gpu.device(), slot, loaded.view, self.sampler)?;
        }
        self.textures.push(loaded);
        tracing::debug!(slot, width, height, path = %path.display(), "loaded texture");
        Ok(slot)
    }

    pub fn table(&self) -> &BindlessTextureTable {
        &self.table
    }

    /// Textures held, including the fallback.
    pub fn len(&self) -> usize {
        self.textures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }

    pub fn destroy(&mut self, gpu: &GpuContext, deletion: &mut DeletionQueue) {
        for texture in self.textures.drain(..) {
            deletion.retire_image_view(gpu.device_arc(), texture.view);
            deletion.retire_image(gpu.allocator(), texture.image);
        }
        if self.sampler != vk::Sampler::null() {
            deletion.retire_sampler(gpu.device_arc(), self.sampler);
            self.sampler = vk::Sampler::null();
        }
    }
}

/// [`TextureUploader`] writing into [`BindlessTextures`].
pub struct GpuTextureUploader<'a> {
    gpu: &'a GpuContext,
    textures: &'a mut BindlessTextures,
}

impl<'a> GpuTextureUploader<'a> {
    pub fn new(gpu: &'a GpuContext, textures: &'a mut BindlessTextures) -> Self {
        Self { gpu, textures }
    }
}

impl TextureUploader for GpuTextureUploader<'_> {
    fn upload_texture(&mut self, path: &Path) -> Result<TextureId> {
        self.textures.load(self.gpu, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_missing_file_is_not_found() {
        assert!(matches!(
            decode_rgba8(Path::new("/nonexistent/albedo.png")),
            Err(lumen_core::Error::NotFound(_))
        ));
    }

    #[test]
    fn decode_rejects_non_image_file() {
        let path = std::env::temp_dir().join("lumen_scene_not_an_image.png");
        std::fs::write(&path, b"definitely not a png").unwrap();
        let result = decode_rgba8(&path);
        std::fs::remove_file(&path).ok();
        assert!(matches!(result, Err(lumen_core::Error::ImageDecode(_))));
    }

    #[test]
    fn decode_round_trips_png_pixels() {
        let path = std::env::temp_dir().join("lumen_scene_2x1.png");
        let img = image::RgbaImage::from_raw(2, 1, vec![255, 0, 0, 255, 0, 255, 0, 128]).unwrap();
        img.save(&path).unwrap();

        let (w, h, pixels) = decode_rgba8(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!((w, h), (2, 1));
        assert_eq!(pixels, vec![255, 0, 0, 255, 0, 255, 0, 128]);
    }
}
