//! Vertex input layouts.
//!
//! A [`VertexLayout`] describes one interleaved vertex stream. It is handed
//! in by the caller when a vertex buffer is created and becomes part of the
//! key under which pipelines are cached.
//!
//! # Example
//!
//! ```
//! use framekit_rhi::vertex::{VertexFormat, VertexLayout};
//!
//! // position, normal, uv
//! let layout = VertexLayout::new()
//!     .push(VertexFormat::Float3)
//!     .push(VertexFormat::Float3)
//!     .push(VertexFormat::Float2);
//! assert_eq!(layout.stride(), 32);
//! ```

use ash::vk;

/// Format of one vertex attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    /// One `f32`
    Float,
    Float2,
    Float3,
    Float4,
    /// Four `u8` normalized to `[0, 1]`, typically a packed color
    UByte4Norm,
    UInt,
}

impl VertexFormat {
    pub fn to_vk(self) -> vk::Format {
        match self {
            VertexFormat::Float => vk::Format::R32_SFLOAT,
            VertexFormat::Float2 => vk::Format::R32G32_SFLOAT,
            VertexFormat::Float3 => vk::Format::R32G32B32_SFLOAT,
            VertexFormat::Float4 => vk::Format::R32G32B32A32_SFLOAT,
            VertexFormat::UByte4Norm => vk::Format::R8G8B8A8_UNORM,
            VertexFormat::UInt => vk::Format::R32_UINT,
        }
    }

    /// Size of the attribute in bytes.
    pub fn size(self) -> u32 {
        match self {
            VertexFormat::Float | VertexFormat::UByte4Norm | VertexFormat::UInt => 4,
            VertexFormat::Float2 => 8,
            VertexFormat::Float3 => 12,
            VertexFormat::Float4 => 16,
        }
    }
}

/// One attribute of a [`VertexLayout`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    /// Shader input location
    pub location: u32,
    pub format: VertexFormat,
    /// Byte offset inside the vertex
    pub offset: u32,
}

/// Interleaved layout of a single vertex binding.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct VertexLayout {
    stride: u32,
    attributes: Vec<VertexAttribute>,
}

impl VertexLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an attribute at the next location, packed after the previous one.
    pub fn push(mut self, format: VertexFormat) -> Self {
        let location = self.attributes.len() as u32;
        self.attributes.push(VertexAttribute {
            location,
            format,
            offset: self.stride,
        });
        self.stride += format.size();
        self
    }

    /// Overrides the stride, e.g. for padded vertex structs.
    pub fn with_stride(mut self, stride: u32) -> Self {
        self.stride = stride;
        self
    }

    #[inline]
    pub fn stride(&self) -> u32 {
        self.stride
    }

    #[inline]
    pub fn attributes(&self) -> &[VertexAttribute] {
        &self.attributes
    }

    /// Per-vertex binding 0 with this layout's stride.
    pub fn binding_description(&self) -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: self.stride,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    pub fn attribute_descriptions(&self) -> Vec<vk::VertexInputAttributeDescription> {
        self.attributes
            .iter()
            .map(|attr| vk::VertexInputAttributeDescription {
                binding: 0,
                location: attr.location,
                format: attr.format.to_vk(),
                offset: attr.offset,
            })
            .collect()
    }
}
