//! Per-draw matrices shared with shaders through descriptor set 0.
//!
//! Shaders read the transforms as a storage buffer array indexed by the
//! instance index, which the engine sets to the draw's position in the
//! frame (`first_instance`).

use bytemuck::{Pod, Zeroable};
use glam::Mat4;

/// Matrices of one draw.
///
/// # Memory Layout
///
/// - Offset 0: model matrix (64 bytes)
/// - Offset 64: view matrix (64 bytes)
/// - Offset 128: projection matrix (64 bytes)
/// - Total size: 192 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct DrawTransforms {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
}

impl DrawTransforms {
    /// Bytes per draw in the transform buffer.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn new(model: Mat4, view: Mat4, proj: Mat4) -> Self {
        Self { model, view, proj }
    }

    /// Clip-space transform, `proj * view * model`.
    pub fn model_view_projection(&self) -> Mat4 {
        self.proj * self.view * self.model
    }
}

impl Default for DrawTransforms {
    fn default() -> Self {
        Self {
            model: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
            proj: Mat4::IDENTITY,
        }
    }
}

/// Size in bytes of a transform buffer holding `max_draws` entries.
pub fn transform_buffer_size(max_draws: usize) -> u64 {
    (max_draws.max(1) * DrawTransforms::SIZE) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn test_size_matches_shader_layout() {
        assert_eq!(DrawTransforms::SIZE, 192);
        assert_eq!(std::mem::align_of::<DrawTransforms>() % 4, 0);
    }

    #[test]
    fn test_default_is_identity() {
        let transforms = DrawTransforms::default();
        assert_eq!(transforms.model_view_projection(), Mat4::IDENTITY);
    }

    #[test]
    fn test_bytes_are_model_then_view_then_proj() {
        let model = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let transforms = DrawTransforms::new(model, Mat4::IDENTITY, Mat4::ZERO);
        let bytes = bytemuck::bytes_of(&transforms);

        assert_eq!(&bytes[..64], bytemuck::bytes_of(&model));
        assert_eq!(&bytes[64..128], bytemuck::bytes_of(&Mat4::IDENTITY));
        assert!(bytes[128..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_buffer_size() {
        assert_eq!(transform_buffer_size(4096), 4096 * 192);
        assert_eq!(transform_buffer_size(0), 192);
    }
}
