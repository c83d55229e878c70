//! Vertex and mesh data handed to the GPU layer.

use crate::error::{Error, Result};

/// Device-uploadable vertex record (48 bytes).
///
/// Position comes first so acceleration structure builds can read it with the
/// vertex stride and an `R32G32B32_SFLOAT` format.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub tangent: [f32; 4],
    pub uv: [f32; 2],
}

impl Vertex {
    /// Byte stride of one vertex.
    pub const STRIDE: u64 = std::mem::size_of::<Self>() as u64;

    /// Create a vertex with a default tangent along +X.
    pub const fn new(position: [f32; 3], normal: [f32; 3], uv: [f32; 2]) -> Self {
        Self {
            position,
            normal,
            tangent: [1.0, 0.0, 0.0, 1.0],
            uv,
        }
    }
}

/// A contiguous index range of a mesh. Each submesh gets its own BLAS.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubMesh {
    /// First index (not byte offset) of this submesh in the index array.
    pub first_index: u32,
    /// Number of indices; always a multiple of 3.
    pub index_count: u32,
}

/// Flat vertex/index arrays for one mesh.
#[derive(Clone, Debug, Default)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub submeshes: Vec<SubMesh>,
}

impl MeshData {
    /// Create a mesh with a single submesh covering all indices.
    pub fn new(vertices: Vec<Vertex>, indices: Vec<u32>) -> Self {
        let index_count = indices.len() as u32;
        Self {
            vertices,
            indices,
            submeshes: vec![SubMesh {
                first_index: 0,
                index_count,
            }],
        }
    }

    /// Number of vertices.
    pub fn vertex_count(&self) -> u32 {
        self.vertices.len() as u32
    }

    /// Number of indices.
    pub fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }

    /// Check that the mesh can be uploaded and built into acceleration structures.
    pub fn validate(&self) -> Result<()> {
        if self.vertices.is_empty() || self.indices.is_empty() {
            return Err(Error::InvalidData("mesh has no geometry".to_string()));
        }
        if self.indices.len() % 3 != 0 {
            return Err(Error::InvalidData(format!(
                "index count {} is not a multiple of 3",
                self.indices.len()
            )));
        }
        let vertex_count = self.vertex_count();
        if let Some(bad) = self.indices.iter().find(|&&i| i >= vertex_count) {
            return Err(Error::InvalidData(format!(
                "index {bad} out of range for {vertex_count} vertices"
            )));
        }
        for sub in &self.submeshes {
            let end = u64::from(sub.first_index) + u64::from(sub.index_count);
            if sub.index_count == 0 || sub.index_count % 3 != 0 || end > self.indices.len() as u64
            {
                return Err(Error::InvalidData(format!("bad submesh range {sub:?}")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> MeshData {
        MeshData::new(
            vec![
                Vertex::new([0.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 0.0]),
                Vertex::new([1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0]),
                Vertex::new([0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0]),
            ],
            vec![0, 1, 2],
        )
    }

    #[test]
    fn vertex_size() {
        assert_eq!(Vertex::STRIDE, 48);
    }

    #[test]
    fn valid_triangle() {
        assert!(triangle().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_index() {
        let mut mesh = triangle();
        mesh.indices[2] = 7;
        assert!(matches!(mesh.validate(), Err(Error::InvalidData(_))));
    }

    #[test]
    fn rejects_partial_triangle() {
        let mut mesh = triangle();
        mesh.indices.push(0);
        assert!(mesh.validate().is_err());
    }

    #[test]
    fn rejects_submesh_past_end() {
        let mut mesh = triangle();
        mesh.submeshes.push(SubMesh {
            first_index: 3,
            index_count: 3,
        });
        assert!(mesh.validate().is_err());
    }
}
