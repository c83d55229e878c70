//! Built-in procedural meshes.

use lumen_core::{MeshData, Vertex};

/// Horizontal plane centered on the origin, facing +Y.
pub fn plane(size: f32) -> MeshData {
    let h = size * 0.5;
    let n = [0.0, 1.0, 0.0];
    MeshData::new(
        vec![
            Vertex::new([-h, 0.0, -h], n, [0.0, 0.0]),
            Vertex::new([h, 0.0, -h], n, [1.0, 0.0]),
            Vertex::new([h, 0.0, h], n, [1.0, 1.0]),
            Vertex::new([-h, 0.0, h], n, [0.0, 1.0]),
        ],
        vec![0, 2, 1, 0, 3, 2],
    )
}

/// Axis-aligned cube centered on the origin with per-face normals.
pub fn cube(size: f32) -> MeshData {
    let h = size * 0.5;
    // (normal, tangent u axis, tangent v axis)
    let faces: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
        ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]),
        ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
        ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0]),
        ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
        ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
    ];

    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for (n, u, v) in faces {
        let base = vertices.len() as u32;
        for (su, sv, uv) in [
            (-1.0, -1.0, [0.0, 1.0]),
            (1.0, -1.0, [1.0, 1.0]),
            (1.0, 1.0, [1.0, 0.0]),
            (-1.0, 1.0, [0.0, 0.0]),
        ] {
            let position = [
                (n[0] + su * u[0] + sv * v[0]) * h,
                (n[1] + su * u[1] + sv * v[1]) * h,
                (n[2] + su * u[2] + sv * v[2]) * h,
            ];
            vertices.push(Vertex::new(position, n, uv));
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }

    MeshData::new(vertices, indices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn winding_matches_normals(mesh: &MeshData) -> bool {
        mesh.indices.chunks_exact(3).all(|tri| {
            let [a, b, c] = [tri[0], tri[1], tri[2]].map(|i| Vec3::from(mesh.vertices[i as usize].position));
            let face = (b - a).cross(c - a);
            face.dot(Vec3::from(mesh.vertices[tri[0] as usize].normal)) > 0.0
        })
    }

    #[test]
    fn plane_is_two_triangles() {
        let mesh = plane(10.0);
        assert!(mesh.validate().is_ok());
        assert_eq!(mesh.vertex_count(), 4);
        assert_eq!(mesh.index_count(), 6);
        assert!(winding_matches_normals(&mesh));
    }

    #[test]
    fn cube_has_separate_face_vertices() {
        let mesh = cube(2.0);
        assert!(mesh.validate().is_ok());
        assert_eq!(mesh.vertex_count(), 24);
        assert_eq!(mesh.index_count(), 36);
        assert!(mesh
            .vertices
            .iter()
            .all(|v| v.position.iter().all(|c| c.abs() == 1.0)));
        assert!(winding_matches_normals(&mesh));
    }
}
