//! Integration tests for model loading.

use std::fs;
use std::path::PathBuf;

use ember_resources::{Model, ModelSource, ResourceError};
use glam::Vec3;

/// Writes a one-triangle glTF with an external buffer and no normals.
fn write_triangle_gltf(dir: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("{dir}-{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();

    let positions: [[f32; 3]; 3] = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
    let indices: [u16; 3] = [0, 1, 2];
    let mut bin = Vec::new();
    for p in positions.iter().flatten() {
        bin.extend_from_slice(&p.to_le_bytes());
    }
    for i in indices {
        bin.extend_from_slice(&i.to_le_bytes());
    }
    bin.extend_from_slice(&[0, 0]);
    fs::write(dir.join("triangle.bin"), &bin).unwrap();

    let json = format!(
        r#"{{
  "asset": {{ "version": "2.0" }},
  "buffers": [{{ "uri": "triangle.bin", "byteLength": {len} }}],
  "bufferViews": [
    {{ "buffer": 0, "byteOffset": 0, "byteLength": 36 }},
    {{ "buffer": 0, "byteOffset": 36, "byteLength": 6 }}
  ],
  "accessors": [
    {{ "bufferView": 0, "componentType": 5126, "count": 3, "type": "VEC3",
       "min": [0.0, 0.0, 0.0], "max": [1.0, 1.0, 0.0] }},
    {{ "bufferView": 1, "componentType": 5123, "count": 3, "type": "SCALAR" }}
  ],
  "materials": [{{ "name": "red", "pbrMetallicRoughness": {{ "baseColorFactor": [1.0, 0.0, 0.0, 1.0] }} }}],
  "meshes": [{{ "name": "tri", "primitives": [{{ "attributes": {{ "POSITION": 0 }}, "indices": 1, "material": 0 }}] }}],
  "nodes": [{{ "mesh": 0 }}],
  "scenes": [{{ "nodes": [0] }}],
  "scene": 0
}}"#,
        len = bin.len()
    );
    let path = dir.join("triangle.gltf");
    fs::write(&path, json).unwrap();
    path
}

#[test]
fn test_load_gltf_model() {
    let path = write_triangle_gltf("ember-gltf-load");
    let model = Model::load(&path).expect("Failed to load glTF model");

    assert_eq!(model.name, "triangle");
    assert_eq!(model.meshes.len(), 1);
    assert_eq!(model.total_vertex_count(), 3);
    assert_eq!(model.total_triangle_count(), 1);

    let mesh = &model.meshes[0];
    assert_eq!(mesh.indices, vec![0, 1, 2]);
    for vertex in &mesh.vertices {
        assert!((vertex.normal - Vec3::Z).length() < 1e-6);
    }

    assert_eq!(model.aabb_min, Vec3::ZERO);
    assert_eq!(model.aabb_max, Vec3::new(1.0, 1.0, 0.0));

    let material = model.material_for(mesh);
    assert_eq!(material.name, "red");
    assert_eq!(material.base_color.y, 0.0);

    fs::remove_dir_all(path.parent().unwrap()).ok();
}

#[test]
fn test_from_source_dispatches() {
    let path = write_triangle_gltf("ember-gltf-source");
    let source = ModelSource::parse(path.to_str().unwrap()).unwrap();
    assert_eq!(Model::from_source(&source).unwrap().total_triangle_count(), 1);

    let cube = Model::from_source(&ModelSource::parse("builtin:cube").unwrap()).unwrap();
    assert_eq!(cube.total_triangle_count(), 12);

    fs::remove_dir_all(path.parent().unwrap()).ok();
}

#[test]
fn test_corrupt_gltf_reports_path() {
    let dir = std::env::temp_dir().join(format!("ember-gltf-bad-{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join("bad.gltf");
    fs::write(&path, "{ not json").unwrap();

    let err = Model::load(&path).unwrap_err();
    assert!(matches!(err, ResourceError::GltfLoad { path: p, .. } if p == path));

    fs::remove_dir_all(&dir).ok();
}
