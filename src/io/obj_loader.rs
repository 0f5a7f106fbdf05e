use crate::error::Result;
use crate::scene::mesh::Mesh;
use log::{info, warn};
use nalgebra::Point3;
use std::path::Path;

/// Loads an OBJ file and returns a single triangulated mesh.
///
/// All models in the file are merged; normals, texture coordinates and materials are ignored
/// (face normals are recomputed from the geometry).
pub fn load_obj<P: AsRef<Path>>(path: P) -> Result<Mesh> {
    let path = path.as_ref();
    info!("Loading OBJ file: {}", path.display());

    // Positions are indexed directly; single_index would split vertices along UV seams.
    let load_options = tobj::LoadOptions {
        triangulate: true,
        single_index: false,
        ..Default::default()
    };
    let (models, _materials) = tobj::load_obj(path, &load_options)?;

    let mut positions = Vec::new();
    let mut faces = Vec::new();
    let mut index_offset = 0u32;

    for model in models {
        let mesh = &model.mesh;
        let num_vertices = mesh.positions.len() / 3;
        if mesh.indices.is_empty() {
            warn!("Model '{}' has no faces, skipping its vertices.", model.name);
            continue;
        }

        positions.extend(
            mesh.positions
                .chunks_exact(3)
                .map(|p| Point3::new(p[0], p[1], p[2])),
        );
        // Offset indices by the vertices already merged from previous models.
        faces.extend(mesh.indices.chunks_exact(3).map(|f| {
            [
                f[0] + index_offset,
                f[1] + index_offset,
                f[2] + index_offset,
            ]
        }));
        index_offset += num_vertices as u32;
    }

    let mesh = Mesh::new(positions, faces)?;
    info!(
        "OBJ loaded successfully. Total vertices: {}, Total faces: {}",
        mesh.vertex_count(),
        mesh.face_count()
    );
    Ok(mesh)
}
