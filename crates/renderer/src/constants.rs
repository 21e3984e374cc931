//! Root constants shared by every built-in pipeline.

use bytemuck::{Pod, Zeroable};

/// Descriptor indices handed to shaders through root parameter 0.
///
/// Shaders index the bindless heaps with these; nothing else is bound per
/// draw.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawConstants {
    /// Frame constant buffer view.
    pub frame: u32,
    /// Object constant buffer view, or 0 for full-screen passes.
    pub object: u32,
    /// Base color texture view.
    pub texture: u32,
    pub sampler: u32,
    /// Shader resource view of the previous frame's ping-pong target.
    pub history: u32,
}

impl DrawConstants {
    pub const DWORDS: usize = std::mem::size_of::<Self>() / 4;

    pub fn as_dwords(&self) -> &[u32] {
        bytemuck::cast_slice(std::slice::from_ref(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dword_order() {
        let constants = DrawConstants {
            frame: 1,
            object: 2,
            texture: 3,
            sampler: 4,
            history: 5,
        };
        assert_eq!(constants.as_dwords(), &[1, 2, 3, 4, 5]);
        assert_eq!(DrawConstants::DWORDS, 5);
    }
}
