//! Decoded texture data.
//!
//! Every texture is stored as tightly packed RGBA8, one byte vector per
//! array layer. Cube maps carry six layers in +X, -X, +Y, -Y, +Z, -Z order.

use std::path::Path;

use ember_rhi::types::Format;
use tracing::debug;

use crate::error::{ResourceError, ResourceResult};

/// Number of faces in a cube map.
pub const CUBE_FACES: usize = 6;

/// Pixels ready for upload.
#[derive(Debug, Clone, PartialEq)]
pub struct TextureData {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub layers: Vec<Vec<u8>>,
}

impl TextureData {
    /// Wraps RGBA8 pixels as a single-layer texture.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::PixelSize`] if `pixels` is not exactly
    /// `width * height * 4` bytes.
    pub fn from_rgba8(
        name: impl Into<String>,
        width: u32,
        height: u32,
        pixels: Vec<u8>,
        srgb: bool,
    ) -> ResourceResult<Self> {
        let name = name.into();
        let expected = width as usize * height as usize * 4;
        if pixels.len() != expected {
            return Err(ResourceError::PixelSize {
                name,
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            name,
            width,
            height,
            format: if srgb { Format::Rgba8Srgb } else { Format::Rgba8Unorm },
            layers: vec![pixels],
        })
    }

    /// A 1x1 texture of one color.
    pub fn solid(name: impl Into<String>, rgba: [u8; 4]) -> Self {
        Self {
            name: name.into(),
            width: 1,
            height: 1,
            format: Format::Rgba8Unorm,
            layers: vec![rgba.to_vec()],
        }
    }

    /// Decodes an image file (PNG or JPEG).
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::FileNotFound`] or the decoder's error.
    pub fn load(path: impl AsRef<Path>, srgb: bool) -> ResourceResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ResourceError::FileNotFound(path.to_path_buf()));
        }
        let image = image::open(path)?.to_rgba8();
        let (width, height) = image.dimensions();
        debug!("Decoded {} ({}x{})", path.display(), width, height);
        Self::from_rgba8(path.display().to_string(), width, height, image.into_raw(), srgb)
    }

    /// Decodes six face images into one cube map.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::CubeFace`] unless every face is square and
    /// the same size as the first.
    pub fn load_cube<P: AsRef<Path>>(faces: &[P; CUBE_FACES], srgb: bool) -> ResourceResult<Self> {
        let mut loaded = Vec::with_capacity(CUBE_FACES);
        for face in faces {
            loaded.push(Self::load(face, srgb)?);
        }
        let name = faces[0].as_ref().display().to_string();
        Self::cube_from_faces(name, loaded)
    }

    /// Joins six single-layer textures into a cube map.
    pub fn cube_from_faces(name: impl Into<String>, faces: Vec<Self>) -> ResourceResult<Self> {
        let Some(first) = faces.first() else {
            return Err(ResourceError::CubeFace {
                face: 0,
                width: 0,
                height: 0,
                expected: 0,
            });
        };
        let (size, format) = (first.width, first.format);

        for (face, data) in faces.iter().enumerate() {
            if data.width != size || data.height != size {
                return Err(ResourceError::CubeFace {
                    face,
                    width: data.width,
                    height: data.height,
                    expected: size,
                });
            }
        }
        if faces.len() != CUBE_FACES {
            return Err(ResourceError::CubeFace {
                face: faces.len(),
                width: 0,
                height: 0,
                expected: size,
            });
        }

        Ok(Self {
            name: name.into(),
            width: size,
            height: size,
            format,
            layers: faces.into_iter().flat_map(|f| f.layers).collect(),
        })
    }

    pub fn is_cube_map(&self) -> bool {
        self.layers.len() == CUBE_FACES
    }

    /// Bytes in one layer.
    pub fn layer_size(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_element() as usize
    }
}

impl TryFrom<&gltf::image::Data> for TextureData {
    type Error = ResourceError;

    fn try_from(data: &gltf::image::Data) -> ResourceResult<Self> {
        let pixels = match data.format {
            gltf::image::Format::R8G8B8A8 => data.pixels.clone(),
            gltf::image::Format::R8G8B8 => data
                .pixels
                .chunks_exact(3)
                .flat_map(|p| [p[0], p[1], p[2], 255])
                .collect(),
            gltf::image::Format::R8 => data.pixels.iter().flat_map(|&v| [v, v, v, 255]).collect(),
            other => {
                debug!("glTF image format {:?} replaced with white", other);
                return Ok(Self::solid("unsupported glTF image", [255; 4]));
            }
        };
        Self::from_rgba8("glTF image", data.width, data.height, pixels, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(size: u32) -> TextureData {
        TextureData::from_rgba8("face", size, size, vec![0; (size * size * 4) as usize], false).unwrap()
    }

    #[test]
    fn test_wrong_pixel_count_rejected() {
        let err = TextureData::from_rgba8("t", 2, 2, vec![0; 15], true).unwrap_err();
        assert!(matches!(err, ResourceError::PixelSize { expected: 16, actual: 15, .. }));
    }

    #[test]
    fn test_cube_from_faces() {
        let cube = TextureData::cube_from_faces("sky", (0..6).map(|_| face(4)).collect()).unwrap();
        assert!(cube.is_cube_map());
        assert_eq!(cube.layers.len(), 6);
        assert_eq!(cube.layer_size(), 64);
    }

    #[test]
    fn test_cube_face_size_mismatch() {
        let mut faces: Vec<_> = (0..6).map(|_| face(4)).collect();
        faces[3] = face(8);
        let err = TextureData::cube_from_faces("sky", faces).unwrap_err();
        assert!(matches!(err, ResourceError::CubeFace { face: 3, .. }));
    }

    #[test]
    fn test_cube_needs_six_faces() {
        let faces: Vec<_> = (0..5).map(|_| face(4)).collect();
        assert!(TextureData::cube_from_faces("sky", faces).is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = TextureData::load("definitely/not/here.png", true).unwrap_err();
        assert!(matches!(err, ResourceError::FileNotFound(_)));
    }
}
