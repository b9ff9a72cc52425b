//! Dynamic rendering helpers (Vulkan 1.3).
//!
//! Passes are begun with `vkCmdBeginRendering` instead of render pass
//! objects. [`PassAttachments`] collects the views of one pass and
//! [`RenderingInfoBundle`] owns the attachment infos for as long as the
//! `VkRenderingInfo` borrowing them is in use.
//!
//! All attachments of a pass share one load behaviour: with a clear color
//! they are cleared, otherwise their previous contents are loaded. Both are
//! always stored.
//!
//! # Example
//!
//! ```no_run
//! use ash::vk;
//! use framekit_rhi::rendering::PassAttachments;
//! use framekit_rhi::command::CommandBuffer;
//!
//! # fn example(color: vk::ImageView, depth: vk::ImageView, cmd: &CommandBuffer) {
//! let bundle = PassAttachments::new(vk::Extent2D { width: 800, height: 600 })
//!     .with_color(color)
//!     .with_depth(depth)
//!     .with_clear([0.1, 0.1, 0.1, 1.0])
//!     .build();
//! cmd.begin_rendering(&bundle.info());
//! cmd.end_rendering();
//! # }
//! ```

use ash::vk;

/// Depth value written when a pass clears its depth attachment.
pub const CLEAR_DEPTH: f32 = 1.0;

/// Attachments and load behaviour of one rendering pass.
#[derive(Clone, Debug)]
pub struct PassAttachments {
    colors: Vec<vk::ImageView>,
    depth: Option<vk::ImageView>,
    extent: vk::Extent2D,
    clear: Option<[f32; 4]>,
}

impl PassAttachments {
    /// Starts an empty pass covering `extent` from the origin.
    pub fn new(extent: vk::Extent2D) -> Self {
        Self {
            colors: Vec::new(),
            depth: None,
            extent,
            clear: None,
        }
    }

    /// Appends one color attachment, expected in `COLOR_ATTACHMENT_OPTIMAL`.
    pub fn with_color(mut self, view: vk::ImageView) -> Self {
        self.colors.push(view);
        self
    }

    pub fn with_colors(mut self, views: impl IntoIterator<Item = vk::ImageView>) -> Self {
        self.colors.extend(views);
        self
    }

    /// Sets the depth attachment, expected in `DEPTH_ATTACHMENT_OPTIMAL`.
    /// A clear resets it to [`CLEAR_DEPTH`].
    pub fn with_depth(mut self, view: vk::ImageView) -> Self {
        self.depth = Some(view);
        self
    }

    /// Clears every attachment at the start of the pass. Without a clear
    /// color the previous contents are loaded.
    pub fn with_clear(mut self, color: [f32; 4]) -> Self {
        self.clear = Some(color);
        self
    }

    /// [`with_clear`](Self::with_clear) for a clear color that may be
    /// switched off.
    pub fn with_optional_clear(mut self, clear: Option<[f32; 4]>) -> Self {
        self.clear = clear;
        self
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Builds the attachment infos. The bundle holds no borrow of `self`.
    pub fn build(&self) -> RenderingInfoBundle {
        let load_op = if self.clear.is_some() {
            vk::AttachmentLoadOp::CLEAR
        } else {
            vk::AttachmentLoadOp::LOAD
        };

        let color_attachments = self
            .colors
            .iter()
            .map(|&view| {
                vk::RenderingAttachmentInfo::default()
                    .image_view(view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(load_op)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .clear_value(vk::ClearValue {
                        color: vk::ClearColorValue {
                            float32: self.clear.unwrap_or([0.0, 0.0, 0.0, 1.0]),
                        },
                    })
            })
            .collect();

        let depth_attachment = self.depth.map(|view| {
            vk::RenderingAttachmentInfo::default()
                .image_view(view)
                .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
                .load_op(load_op)
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: CLEAR_DEPTH,
                        stencil: 0,
                    },
                })
        });

        RenderingInfoBundle {
            color_attachments,
            depth_attachment,
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.extent,
            },
        }
    }
}

/// Owned attachment infos of one pass.
///
/// `VkRenderingInfo` only points at its attachments, so the bundle has to
/// stay alive until `vkCmdBeginRendering` has been recorded.
pub struct RenderingInfoBundle {
    color_attachments: Vec<vk::RenderingAttachmentInfo<'static>>,
    depth_attachment: Option<vk::RenderingAttachmentInfo<'static>>,
    render_area: vk::Rect2D,
}

impl RenderingInfoBundle {
    /// Returns the `VkRenderingInfo` referencing this bundle's data.
    pub fn info(&self) -> vk::RenderingInfo<'_> {
        let mut info = vk::RenderingInfo::default()
            .render_area(self.render_area)
            .layer_count(1)
            .color_attachments(&self.color_attachments);

        if let Some(ref depth) = self.depth_attachment {
            info = info.depth_attachment(depth);
        }

        info
    }

    #[inline]
    pub fn color_attachments(&self) -> &[vk::RenderingAttachmentInfo<'static>] {
        &self.color_attachments
    }

    #[inline]
    pub fn depth_attachment(&self) -> Option<&vk::RenderingAttachmentInfo<'static>> {
        self.depth_attachment.as_ref()
    }

    #[inline]
    pub fn render_area(&self) -> vk::Rect2D {
        self.render_area
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent() -> vk::Extent2D {
        vk::Extent2D {
            width: 640,
            height: 480,
        }
    }

    #[test]
    fn test_clear_sets_load_op_on_all_attachments() {
        let bundle = PassAttachments::new(extent())
            .with_colors([vk::ImageView::null(), vk::ImageView::null()])
            .with_depth(vk::ImageView::null())
            .with_clear([0.2, 0.3, 0.4, 1.0])
            .build();

        assert_eq!(bundle.color_attachments().len(), 2);
        for color in bundle.color_attachments() {
            assert_eq!(color.load_op, vk::AttachmentLoadOp::CLEAR);
            assert_eq!(unsafe { color.clear_value.color.float32 }, [0.2, 0.3, 0.4, 1.0]);
        }
        let depth = bundle.depth_attachment().copied();
        assert!(depth.is_some());
        if let Some(depth) = depth {
            assert_eq!(depth.load_op, vk::AttachmentLoadOp::CLEAR);
            assert_eq!(depth.image_layout, vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL);
        }
    }

    #[test]
    fn test_no_clear_loads_previous_contents() {
        let bundle = PassAttachments::new(extent())
            .with_color(vk::ImageView::null())
            .build();

        assert_eq!(
            bundle.color_attachments()[0].load_op,
            vk::AttachmentLoadOp::LOAD
        );
        assert!(bundle.depth_attachment().is_none());
    }

    #[test]
    fn test_render_area_matches_extent() {
        let bundle = PassAttachments::new(extent()).build();
        let info = bundle.info();
        assert_eq!(info.render_area.extent.width, 640);
        assert_eq!(info.render_area.extent.height, 480);
        assert_eq!(info.layer_count, 1);
    }
}
