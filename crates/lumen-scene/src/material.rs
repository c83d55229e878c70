//! Material library with path-keyed texture loading.
//!
//! Texture failures never fail a material: the slot falls back to
//! [`NULL_TEXTURE_ID`] and shaders use the material factors instead.

use crate::components::MaterialId;
use crate::error::Result;
use ash::vk;
use lumen_core::constants::NULL_TEXTURE_ID;
use lumen_core::{MaterialDescriptor, TextureId};
use lumen_gpu::{
    create_buffer_with_data, BufferDesc, DeletionQueue, GpuBuffer, GpuContext, MemoryLocation,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Loads a texture file into the bindless table.
pub trait TextureUploader {
    fn upload_texture(&mut self, path: &Path) -> Result<TextureId>;
}

/// Parameters of a material before its textures are resolved.
#[derive(Clone, Debug, PartialEq)]
pub struct MaterialSource {
    pub name: String,
    pub base_color_factor: [f32; 4],
    pub emissive_factor: [f32; 3],
    pub metallic_factor: f32,
    pub roughness_factor: f32,
    pub base_color_texture: Option<PathBuf>,
    pub normal_texture: Option<PathBuf>,
    pub metallic_roughness_texture: Option<PathBuf>,
    pub emissive_texture: Option<PathBuf>,
}

impl Default for MaterialSource {
    fn default() -> Self {
        let defaults = MaterialDescriptor::default();
        Self {
            name: String::new(),
            base_color_factor: defaults.base_color_factor,
            emissive_factor: defaults.emissive_factor,
            metallic_factor: defaults.metallic_factor,
            roughness_factor: defaults.roughness_factor,
            base_color_texture: None,
            normal_texture: None,
            metallic_roughness_texture: None,
            emissive_texture: None,
        }
    }
}

impl MaterialSource {
    /// Untextured material with a base color.
    pub fn colored(name: impl Into<String>, base_color: [f32; 4]) -> Self {
        Self {
            name: name.into(),
            base_color_factor: base_color,
            ..Self::default()
        }
    }
}

#[derive(Default)]
pub struct MaterialLibrary {
    materials: Vec<MaterialDescriptor>,
    names: Vec<String>,
    /// Paths of successfully loaded textures, in load order.
    textures: Vec<PathBuf>,
    texture_ids: HashMap<PathBuf, TextureId>,
    buffer: Option<GpuBuffer>,
    dirty: bool,
}

impl MaterialLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve textures and register a material. Always succeeds.
    pub fn try_to_load_material(
        &mut self,
        source: &MaterialSource,
        uploader: &mut impl TextureUploader,
    ) -> MaterialId {
        let descriptor = MaterialDescriptor {
            base_color_factor: source.base_color_factor,
            emissive_factor: source.emissive_factor,
            metallic_factor: source.metallic_factor,
            roughness_factor: source.roughness_factor,
            base_color_texture: self.load_texture(source.base_color_texture.as_deref(), uploader),
            normal_texture: self.load_texture(source.normal_texture.as_deref(), uploader),
            metallic_roughness_texture: self
                .load_texture(source.metallic_roughness_texture.as_deref(), uploader),
            emissive_texture: self.load_texture(source.emissive_texture.as_deref(), uploader),
            ..MaterialDescriptor::default()
        };

        self.materials.push(descriptor);
        self.names.push(source.name.clone());
        self.dirty = true;
        let id = self.materials.len() as MaterialId - 1;
        debug!(id, name = %source.name, "registered material");
        id
    }

    fn load_texture(&mut self, path: Option<&Path>, uploader: &mut impl TextureUploader) -> TextureId {
        let Some(path) = path else {
            return NULL_TEXTURE_ID;
        };
        if let Some(&id) = self.texture_ids.get(path) {
            return id;
        }

        match uploader.upload_texture(path) {
            Ok(id) => {
                self.textures.push(path.to_path_buf());
                self.texture_ids.insert(path.to_path_buf(), id);
                id
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load texture, using fallback");
                NULL_TEXTURE_ID
            }
        }
    }

    pub fn get(&self, id: MaterialId) -> Option<&MaterialDescriptor> {
        self.materials.get(id as usize)
    }

    pub fn find(&self, name: &str) -> Option<MaterialId> {
        self.names.iter().position(|n| n == name).map(|i| i as MaterialId)
    }

    pub fn len(&self) -> usize {
        self.materials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }

    pub fn textures(&self) -> &[PathBuf] {
        &self.textures
    }

    pub fn texture_id(&self, path: &Path) -> Option<TextureId> {
        self.texture_ids.get(path).copied()
    }

    /// Descriptors as uploaded to the GPU; never empty.
    pub fn gpu_records(&self) -> Vec<MaterialDescriptor> {
        if self.materials.is_empty() {
            vec![MaterialDescriptor::default()]
        } else {
            self.materials.clone()
        }
    }

    /// Upload the material array if it changed. Returns whether the buffer was replaced.
    ///
    /// A new buffer is created on every change and the old one retired, so
    /// frames in flight keep reading the records they were recorded with.
    pub fn sync_gpu_buffer(&mut self, gpu: &GpuContext, deletion: &mut DeletionQueue) -> Result<bool> {
        if !self.dirty && self.buffer.is_some() {
            return Ok(false);
        }

        let records = self.gpu_records();
        let bytes: &[u8] = bytemuck::cast_slice(&records);
        let buffer = create_buffer_with_data(
            gpu,
            &BufferDesc::new(
                "materials",
                bytes.len() as u64,
                vk::BufferUsageFlags::STORAGE_BUFFER,
                MemoryLocation::CpuToGpu,
            ),
            bytes,
        )?;

        if let Some(old) = self.buffer.replace(buffer) {
            deletion.retire_buffer(gpu.allocator(), old);
        }
        self.dirty = false;
        Ok(true)
    }

    pub fn gpu_buffer(&self) -> Option<&GpuBuffer> {
        self.buffer.as_ref()
    }

    pub fn destroy(&mut self, gpu: &GpuContext, deletion: &mut DeletionQueue) {
        if let Some(buffer) = self.buffer.take() {
            deletion.retire_buffer(gpu.allocator(), buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SceneError;

    /// Accepts paths ending in `.png`, assigning sequential ids from 1.
    #[derive(Default)]
    struct MockUploader {
        uploads: Vec<PathBuf>,
    }

    impl TextureUploader for MockUploader {
        fn upload_texture(&mut self, path: &Path) -> Result<TextureId> {
            if path.extension().is_some_and(|e| e == "png") {
                self.uploads.push(path.to_path_buf());
                Ok(self.uploads.len() as TextureId)
            } else {
                Err(SceneError::Data(lumen_core::Error::NotFound(
                    path.display().to_string(),
                )))
            }
        }
    }

    #[test]
    fn missing_texture_falls_back_to_null_id() {
        let mut library = MaterialLibrary::new();
        let mut uploader = MockUploader::default();

        let id = library.try_to_load_material(
            &MaterialSource {
                base_color_texture: Some(PathBuf::from("assets/missing.jpg")),
                ..MaterialSource::colored("broken", [1.0, 0.0, 0.0, 1.0])
            },
            &mut uploader,
        );

        let material = library.get(id).unwrap();
        assert_eq!(material.base_color_texture, NULL_TEXTURE_ID);
        assert_eq!(material.base_color_factor, [1.0, 0.0, 0.0, 1.0]);
        assert!(library.textures().is_empty());
        assert!(uploader.uploads.is_empty());
    }

    #[test]
    fn same_path_reuses_texture_id() {
        let mut library = MaterialLibrary::new();
        let mut uploader = MockUploader::default();
        let textured = MaterialSource {
            base_color_texture: Some(PathBuf::from("albedo.png")),
            emissive_texture: Some(PathBuf::from("albedo.png")),
            normal_texture: Some(PathBuf::from("normal.png")),
            ..MaterialSource::default()
        };

        let a = library.try_to_load_material(&textured, &mut uploader);
        let b = library.try_to_load_material(&textured, &mut uploader);

        assert_ne!(a, b);
        assert_eq!(uploader.uploads.len(), 2);
        assert_eq!(library.textures().len(), 2);
        let material = library.get(b).unwrap();
        assert_eq!(material.base_color_texture, 1);
        assert_eq!(material.emissive_texture, 1);
        assert_eq!(material.normal_texture, 2);
        assert_eq!(library.texture_id(Path::new("normal.png")), Some(2));
    }

    #[test]
    fn ids_are_sequential_and_findable() {
        let mut library = MaterialLibrary::new();
        let mut uploader = MockUploader::default();
        assert_eq!(library.gpu_records().len(), 1);

        let red = library.try_to_load_material(&MaterialSource::colored("red", [1.0, 0.0, 0.0, 1.0]), &mut uploader);
        let blue = library.try_to_load_material(&MaterialSource::colored("blue", [0.0, 0.0, 1.0, 1.0]), &mut uploader);

        assert_eq!((red, blue), (0, 1));
        assert_eq!(library.find("blue"), Some(1));
        assert_eq!(library.find("green"), None);
        assert_eq!(library.gpu_records().len(), 2);
    }
}
