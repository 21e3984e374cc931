//! Scene description and the scene graph the passes draw from.
//!
//! A scene description is a JSON list of models:
//!
//! ```json
//! [
//!     { "Path": "models/helmet.gltf" },
//!     { "Path": "builtin:cube", "Position": [2.0, 0.0, 0.0], "Scale": 0.5 }
//! ]
//! ```

use std::path::Path;
use std::sync::Arc;

use ember_resources::{Model, ModelSource, TextureData};
use ember_rhi::command::CommandList;
use ember_rhi::descriptor::DescriptorHandle;
use ember_rhi::resource::{ResourceDescriptor, ResourceManager, TextureDescriptor};
use ember_rhi::types::{SamplerDesc, TextureDesc, TextureUsage};
use glam::Vec3;
use serde::Deserialize;
use tracing::{debug, info};

use crate::camera::Camera;
use crate::constants::FrameConstants;
use crate::error::{SceneError, SceneResult};
use crate::light::DirectionalLight;
use crate::model::{GpuMesh, RenderModel, UploadOptions};
use crate::transform::Transform;

/// One entry of a scene description.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SceneEntry {
    /// glTF file, or `builtin:cube` / `builtin:triangle`.
    pub path: String,
    #[serde(default)]
    pub position: [f32; 3],
    #[serde(default = "unit_scale")]
    pub scale: f32,
}

fn unit_scale() -> f32 {
    1.0
}

impl SceneEntry {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            position: [0.0; 3],
            scale: 1.0,
        }
    }

    pub fn transform(&self) -> Transform {
        Transform::from_position(Vec3::from_array(self.position)).with_uniform_scale(self.scale)
    }
}

/// Ordered list of models to load.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct SceneDescription {
    pub entries: Vec<SceneEntry>,
}

impl SceneDescription {
    /// Reads a description file. Relative model paths are resolved against
    /// the file's directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable, malformed, or empty.
    pub fn load(path: impl AsRef<Path>) -> SceneResult<Self> {
        let path = path.as_ref();
        let mut description: Self = ember_core::read_json(path)?;
        if description.entries.is_empty() {
            return Err(SceneError::Empty(path.display().to_string()));
        }
        if let Some(base) = path.parent() {
            for entry in &mut description.entries {
                if let ModelSource::File(file) = ModelSource::parse(&entry.path)?
                    && file.is_relative()
                {
                    entry.path = base.join(file).display().to_string();
                }
            }
        }
        Ok(description)
    }

    /// Parses a description from a JSON string.
    pub fn from_json_str(text: &str) -> SceneResult<Self> {
        let description: Self = serde_json::from_str(text).map_err(|source| ember_core::Error::Json {
            path: "<inline>".to_string(),
            source,
        })?;
        if description.entries.is_empty() {
            return Err(SceneError::Empty("<inline>".to_string()));
        }
        Ok(description)
    }
}

/// Renderable models, camera, light and per-frame constants.
pub struct Scene {
    pub camera: Camera,
    pub light: DirectionalLight,
    models: Vec<RenderModel>,
    frame_constants: Vec<ResourceDescriptor>,
    fallback_texture: TextureDescriptor,
    sampler: DescriptorHandle,
    options: UploadOptions,
    // Last, so everything above is retired while the manager is alive.
    resources: Arc<ResourceManager>,
}

impl Scene {
    /// Creates an empty scene with `frame_count` frame constant buffers, a
    /// white fallback texture and a linear sampler. The fallback texture's
    /// upload is recorded into `list`.
    ///
    /// # Errors
    ///
    /// Returns an error if a buffer, texture or view cannot be created.
    pub fn new(
        resources: Arc<ResourceManager>,
        list: &mut CommandList,
        frame_count: usize,
        options: UploadOptions,
    ) -> SceneResult<Self> {
        let frame_constants = (0..frame_count)
            .map(|slot| {
                resources.create_constant_buffer(
                    &format!("frame constants {slot}"),
                    FrameConstants::SIZE as u64,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let white = TextureData::solid("fallback white", [255; 4]);
        let mut fallback_texture = resources.create_texture(
            TextureDesc::new_2d(&white.name, 1, 1, white.format, TextureUsage::SAMPLED),
            false,
            false,
        )?;
        fallback_texture.write_layer(&resources, 0, &white.layers[0])?;
        fallback_texture.record_upload(list)?;

        let sampler = resources.create_sampler(&SamplerDesc::default())?;

        Ok(Self {
            camera: Camera::new(),
            light: DirectionalLight::default(),
            models: Vec::new(),
            frame_constants,
            fallback_texture,
            sampler,
            options,
            resources,
        })
    }

    /// Builds a scene from a description, recording every upload into
    /// `list`, and points the camera at the result.
    pub fn from_description(
        resources: Arc<ResourceManager>,
        list: &mut CommandList,
        description: &SceneDescription,
        frame_count: usize,
        options: UploadOptions,
    ) -> SceneResult<Self> {
        let mut scene = Self::new(resources, list, frame_count, options)?;
        for entry in &description.entries {
            let source = ModelSource::parse(&entry.path)?;
            let model = Model::from_source(&source)?;
            scene.add_model(list, &model, entry.transform())?;
        }
        scene.frame_camera();
        info!("Scene ready with {} model(s)", scene.models.len());
        Ok(scene)
    }

    /// Uploads a model and returns its index.
    pub fn add_model(
        &mut self,
        list: &mut CommandList,
        model: &Model,
        transform: Transform,
    ) -> SceneResult<usize> {
        let mut render_model = RenderModel::upload(
            &self.resources,
            list,
            model,
            self.frame_count(),
            &self.options,
        )?;
        render_model.transform = transform;
        self.models.push(render_model);
        debug!("Added model '{}'", model.name);
        Ok(self.models.len() - 1)
    }

    /// Places the camera so every model is in view.
    pub fn frame_camera(&mut self) {
        if let Some((min, max)) = self.bounds() {
            self.camera.frame_bounds(min, max);
        }
    }

    /// World-space bounds of all models.
    pub fn bounds(&self) -> Option<(Vec3, Vec3)> {
        self.models
            .iter()
            .map(RenderModel::world_bounds)
            .reduce(|(amin, amax), (bmin, bmax)| (amin.min(bmin), amax.max(bmax)))
    }

    pub fn models(&self) -> &[RenderModel] {
        &self.models
    }

    pub fn models_mut(&mut self) -> &mut [RenderModel] {
        &mut self.models
    }

    pub fn frame_count(&self) -> usize {
        self.frame_constants.len()
    }

    /// Constant buffer view index of a slot's frame constants.
    pub fn frame_constants_index(&self, slot: usize) -> Option<u32> {
        self.frame_constants.get(slot)?.descriptor_index()
    }

    pub fn sampler_index(&self) -> u32 {
        self.sampler.index()
    }

    /// Texture view for a mesh, falling back to plain white.
    pub fn texture_index(&self, model: &RenderModel, mesh: &GpuMesh) -> u32 {
        model
            .texture_index(mesh)
            .unwrap_or_else(|| self.fallback_texture.srv_index())
    }

    /// Matches the camera's aspect ratio to the output size.
    pub fn resize(&mut self, width: u32, height: u32) {
        if height > 0 {
            self.camera.set_aspect(width as f32 / height as f32);
        }
    }

    /// Writes the frame and object constants of one frame slot.
    ///
    /// The caller guarantees the slot's previous frame has completed on
    /// the GPU, which the frame pacing does before handing a slot out.
    ///
    /// # Errors
    ///
    /// Returns [`SceneError::FrameSlot`] for a slot outside the scene's
    /// frame count, or the device's write error.
    pub fn update(&self, slot: usize, time: f32, frame: u64) -> SceneResult<()> {
        let Some(buffer) = self.frame_constants.get(slot) else {
            return Err(SceneError::FrameSlot {
                slot,
                count: self.frame_constants.len(),
            });
        };
        let constants = FrameConstants::new(&self.camera, &self.light, time, frame);
        self.resources
            .write_buffer(buffer, 0, bytemuck::bytes_of(&constants))?;
        for model in &self.models {
            model.write_constants(&self.resources, slot)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_description() {
        let description = SceneDescription::from_json_str(
            r#"[{ "Path": "builtin:cube" }, { "Path": "a.gltf", "Position": [1, 2, 3], "Scale": 2 }]"#,
        )
        .unwrap();
        assert_eq!(description.entries.len(), 2);
        assert_eq!(description.entries[0], SceneEntry::new("builtin:cube"));
        assert_eq!(description.entries[1].position, [1.0, 2.0, 3.0]);
        assert_eq!(description.entries[1].transform().scale, Vec3::splat(2.0));
    }

    #[test]
    fn test_empty_description_rejected() {
        assert!(matches!(
            SceneDescription::from_json_str("[]"),
            Err(SceneError::Empty(_))
        ));
    }

    #[test]
    fn test_malformed_description_is_config_error() {
        let err = SceneDescription::from_json_str(r#"[{ "File": "x" }]"#).unwrap_err();
        assert!(matches!(err, SceneError::Description(ember_core::Error::Json { .. })));
    }

    #[test]
    fn test_relative_paths_resolve_against_file() {
        let dir = std::env::temp_dir().join(format!("ember-scene-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("scene.json");
        std::fs::write(&path, r#"[{ "Path": "models/a.gltf" }, { "Path": "builtin:triangle" }]"#)
            .unwrap();

        let description = SceneDescription::load(&path).unwrap();
        assert_eq!(
            description.entries[0].path,
            dir.join("models/a.gltf").display().to_string()
        );
        assert_eq!(description.entries[1].path, "builtin:triangle");
        std::fs::remove_dir_all(&dir).ok();
    }
}
