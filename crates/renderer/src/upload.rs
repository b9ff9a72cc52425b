//! Deferred copies from the staging ring into device-local resources.
//!
//! Updates to resources the CPU cannot write are staged in the staging ring
//! and queued here. The queue is flushed once per frame, after the command
//! buffer is opened and before any draw is recorded, so every draw of the
//! frame sees the uploaded data.
//!
//! Flushed copies stay queued until the submission carrying them is
//! confirmed with [`UploadQueue::commit`]. If that submission never
//! executes, [`UploadQueue::rollback`] restores the image layouts the flush
//! assumed and the copies go out with the next frame instead.

use tracing::{trace, warn};

use framekit_rhi::image::ImageLayout;

use crate::backend::{Backend, BufferCopyRegion, TransferBarrier};
use crate::error::{RenderError, RenderResult};
use crate::handle::ImageHandle;
use crate::resources::{BufferRef, Resources};
use crate::ring::TransientAllocation;

/// Staged bytes bound for `dst` at `dst_offset`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferCopy {
    pub src: TransientAllocation,
    pub dst: BufferRef,
    pub dst_offset: u64,
}

/// Staged texels covering the whole of `dst`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageCopy {
    pub src: TransientAllocation,
    pub dst: ImageHandle,
}

/// Copies recorded by one [`UploadQueue::flush`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub buffer_copies: u32,
    pub image_copies: u32,
    /// Copies dropped because their destination was destroyed
    pub skipped: u32,
}

/// Pending copies, bounded per frame by the configured copy limits.
pub struct UploadQueue {
    buffer_copies: Vec<BufferCopy>,
    image_copies: Vec<ImageCopy>,
    /// Layouts of flushed image destinations before the flush
    flushed_layouts: Vec<(ImageHandle, ImageLayout)>,
    max_buffer_copies: usize,
    max_image_copies: usize,
}

impl UploadQueue {
    /// Creates an empty queue with per-frame copy limits.
    pub fn new(max_buffer_copies: usize, max_image_copies: usize) -> Self {
        Self {
            buffer_copies: Vec::with_capacity(max_buffer_copies),
            image_copies: Vec::with_capacity(max_image_copies),
            flushed_layouts: Vec::new(),
            max_buffer_copies,
            max_image_copies,
        }
    }

    /// Fails when another buffer copy would exceed the per-frame limit.
    pub fn reserve_buffer_copy(&self) -> RenderResult<()> {
        if self.buffer_copies.len() >= self.max_buffer_copies {
            return Err(RenderError::capacity("buffer copies", self.max_buffer_copies));
        }
        Ok(())
    }

    /// Fails when another image copy would exceed the per-frame limit.
    pub fn reserve_image_copy(&self) -> RenderResult<()> {
        if self.image_copies.len() >= self.max_image_copies {
            return Err(RenderError::capacity("image copies", self.max_image_copies));
        }
        Ok(())
    }

    /// Queues a buffer copy for the next flush.
    ///
    /// # Errors
    ///
    /// [`RenderError::CapacityExceeded`] once `max_buffer_copies` are queued.
    pub fn enqueue_buffer_copy(&mut self, copy: BufferCopy) -> RenderResult<()> {
        self.reserve_buffer_copy()?;
        trace!(dst = ?copy.dst, size = copy.src.size, "queue buffer copy");
        self.buffer_copies.push(copy);
        Ok(())
    }

    /// Queues an image copy for the next flush.
    ///
    /// # Errors
    ///
    /// [`RenderError::CapacityExceeded`] once `max_image_copies` are queued.
    pub fn enqueue_image_copy(&mut self, copy: ImageCopy) -> RenderResult<()> {
        self.reserve_image_copy()?;
        trace!(dst = ?copy.dst, size = copy.src.size, "queue image copy");
        self.image_copies.push(copy);
        Ok(())
    }

    pub fn buffer_copies(&self) -> &[BufferCopy] {
        &self.buffer_copies
    }

    pub fn image_copies(&self) -> &[ImageCopy] {
        &self.image_copies
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buffer_copies.len() + self.image_copies.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every queued copy without recording it.
    pub fn clear(&mut self) {
        self.buffer_copies.clear();
        self.image_copies.clear();
        self.flushed_layouts.clear();
    }

    /// The last flush reached the GPU: its copies leave the queue.
    pub fn commit(&mut self) {
        self.clear();
    }

    /// The last flush never executed. Its copies stay queued and the
    /// tracked image layouts go back to what they were before it.
    pub fn rollback<B: Backend>(&mut self, resources: &mut Resources<B>) {
        for (handle, layout) in self.flushed_layouts.drain(..).rev() {
            if let Some(entry) = resources.images.find_mut(handle) {
                entry.layout = layout;
            }
        }
    }

    /// Records every queued copy with its barriers.
    ///
    /// Buffer destinations are guarded on both sides: earlier reads by the
    /// buffer's consumers finish before the copy, and the copy is made
    /// visible to them afterwards. Image destinations move to
    /// transfer-destination for the copy and end up shader-readable.
    pub fn flush<B: Backend>(
        &mut self,
        backend: &mut B,
        frame: &B::Frame,
        staging: &B::Buffer,
        resources: &mut Resources<B>,
    ) -> FlushStats {
        let mut stats = FlushStats::default();
        self.flushed_layouts.clear();

        for copy in &self.buffer_copies {
            let Some(dst) = resources.buffer(copy.dst) else {
                warn!("Dropping upload to destroyed buffer {:?}", copy.dst);
                stats.skipped += 1;
                continue;
            };
            let range = (copy.dst_offset, copy.src.size);
            backend.cmd_buffer_barrier(frame, &dst.buffer, range, dst.usage, TransferBarrier::BeforeWrite);
            backend.cmd_copy_buffer(
                frame,
                staging,
                &dst.buffer,
                BufferCopyRegion {
                    src_offset: copy.src.offset,
                    dst_offset: copy.dst_offset,
                    size: copy.src.size,
                },
            );
            backend.cmd_buffer_barrier(frame, &dst.buffer, range, dst.usage, TransferBarrier::AfterWrite);
            stats.buffer_copies += 1;
        }

        for copy in &self.image_copies {
            let Some(dst) = resources.images.find_mut(copy.dst) else {
                warn!("Dropping upload to destroyed image {:?}", copy.dst);
                stats.skipped += 1;
                continue;
            };
            self.flushed_layouts.push((copy.dst, dst.layout));
            backend.cmd_image_barrier(frame, &dst.image, dst.layout, ImageLayout::TransferDst);
            backend.cmd_copy_buffer_to_image(frame, staging, copy.src.offset, &dst.image);
            backend.cmd_image_barrier(frame, &dst.image, ImageLayout::TransferDst, ImageLayout::ShaderRead);
            dst.layout = ImageLayout::ShaderRead;
            stats.image_copies += 1;
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::Command;
    use crate::backend::{BufferDesc, HeadlessBackend, ImageDesc};
    use crate::resources::{BufferEntry, ImageEntry};
    use crate::ring::{TransientPool, TransientPools};
    use framekit_rhi::buffer::BufferUsage;
    use framekit_rhi::image::{Format, ImageUsage};

    struct Fixture {
        backend: HeadlessBackend,
        pools: TransientPools<HeadlessBackend>,
        resources: Resources<HeadlessBackend>,
    }

    fn fixture() -> Fixture {
        let mut backend = HeadlessBackend::new(8, 8);
        let pools = TransientPools::new(&mut backend, 256, 256, 1024, 16).unwrap();
        Fixture {
            backend,
            pools,
            resources: Resources::new(),
        }
    }

    fn storage(f: &mut Fixture, size: u64) -> BufferRef {
        let buffer = f
            .backend
            .create_buffer(&BufferDesc {
                size,
                usage: BufferUsage::Storage,
                host_visible: false,
            })
            .unwrap();
        BufferRef::Storage(f.resources.storage_buffers.insert(BufferEntry {
            buffer,
            size,
            usage: BufferUsage::Storage,
            host_visible: false,
        }))
    }

    #[test]
    fn test_capacity_limits() {
        let mut f = fixture();
        let dst = storage(&mut f, 16);
        let src = f.pools.allocate(TransientPool::Staging, 4).unwrap();
        let mut queue = UploadQueue::new(1, 0);

        queue
            .enqueue_buffer_copy(BufferCopy {
                src,
                dst,
                dst_offset: 0,
            })
            .unwrap();
        assert!(matches!(
            queue.enqueue_buffer_copy(BufferCopy {
                src,
                dst,
                dst_offset: 4,
            }),
            Err(RenderError::CapacityExceeded { limit: 1, .. })
        ));
        assert!(queue.reserve_image_copy().is_err());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_flush_copies_with_barriers() {
        let mut f = fixture();
        let dst = storage(&mut f, 16);
        let frame = f.backend.create_frame().unwrap();
        let src = f
            .pools
            .allocate_with(&mut f.backend, TransientPool::Staging, &[5; 8])
            .unwrap();
        let mut queue = UploadQueue::new(4, 4);
        queue
            .enqueue_buffer_copy(BufferCopy {
                src,
                dst,
                dst_offset: 8,
            })
            .unwrap();

        f.backend.begin_commands(&frame).unwrap();
        let stats = queue.flush(
            &mut f.backend,
            &frame,
            f.pools.buffer(TransientPool::Staging),
            &mut f.resources,
        );
        f.backend.end_commands(&frame).unwrap();
        f.backend.submit(&frame).unwrap();
        queue.commit();

        assert_eq!(stats.buffer_copies, 1);
        assert!(queue.is_empty());
        let commands = f.backend.submitted_commands();
        assert!(matches!(
            commands,
            [
                Command::BufferBarrier {
                    barrier: TransferBarrier::BeforeWrite,
                    usage: BufferUsage::Storage,
                    ..
                },
                Command::CopyBuffer { .. },
                Command::BufferBarrier {
                    barrier: TransferBarrier::AfterWrite,
                    ..
                },
            ]
        ));
        let entry = f.resources.buffer(dst).unwrap();
        assert_eq!(&f.backend.buffer_data(&entry.buffer)[8..], &[5; 8]);
    }

    #[test]
    fn test_flush_transitions_images() {
        let mut f = fixture();
        let frame = f.backend.create_frame().unwrap();
        let desc = ImageDesc {
            width: 2,
            height: 2,
            format: Format::Rgba8Unorm,
            usage: ImageUsage::Sampled,
        };
        let image = f.resources.images.insert(ImageEntry {
            image: f.backend.create_image(&desc).unwrap(),
            desc,
            layout: ImageLayout::Undefined,
        });
        let src = f
            .pools
            .allocate_with(&mut f.backend, TransientPool::Staging, &[1; 16])
            .unwrap();
        let mut queue = UploadQueue::new(4, 4);
        queue.enqueue_image_copy(ImageCopy { src, dst: image }).unwrap();

        f.backend.begin_commands(&frame).unwrap();
        let stats = queue.flush(
            &mut f.backend,
            &frame,
            f.pools.buffer(TransientPool::Staging),
            &mut f.resources,
        );
        f.backend.end_commands(&frame).unwrap();
        f.backend.submit(&frame).unwrap();
        queue.commit();

        assert_eq!(stats.image_copies, 1);
        let entry = f.resources.images.get(image).unwrap();
        assert_eq!(entry.layout, ImageLayout::ShaderRead);
        assert_eq!(f.backend.image_data(&entry.image), &[1; 16]);
        assert_eq!(
            f.backend.count_submitted(|c| matches!(c, Command::ImageBarrier { .. })),
            2
        );
    }

    #[test]
    fn test_destroyed_destination_is_skipped() {
        let mut f = fixture();
        let dst = storage(&mut f, 16);
        let frame = f.backend.create_frame().unwrap();
        let src = f.pools.allocate(TransientPool::Staging, 4).unwrap();
        let mut queue = UploadQueue::new(4, 4);
        queue
            .enqueue_buffer_copy(BufferCopy {
                src,
                dst,
                dst_offset: 0,
            })
            .unwrap();
        if let BufferRef::Storage(handle) = dst {
            let entry = f.resources.storage_buffers.remove(handle).unwrap();
            f.backend.destroy_buffer(entry.buffer);
        }

        f.backend.begin_commands(&frame).unwrap();
        let stats = queue.flush(
            &mut f.backend,
            &frame,
            f.pools.buffer(TransientPool::Staging),
            &mut f.resources,
        );
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.buffer_copies, 0);
        queue.commit();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_rollback_keeps_copies_and_layouts() {
        let mut f = fixture();
        let frame = f.backend.create_frame().unwrap();
        let desc = ImageDesc {
            width: 1,
            height: 1,
            format: Format::Rgba8Unorm,
            usage: ImageUsage::Sampled,
        };
        let image = f.resources.images.insert(ImageEntry {
            image: f.backend.create_image(&desc).unwrap(),
            desc,
            layout: ImageLayout::Undefined,
        });
        let src = f.pools.allocate(TransientPool::Staging, 4).unwrap();
        let mut queue = UploadQueue::new(4, 4);
        queue.enqueue_image_copy(ImageCopy { src, dst: image }).unwrap();

        f.backend.begin_commands(&frame).unwrap();
        queue.flush(
            &mut f.backend,
            &frame,
            f.pools.buffer(TransientPool::Staging),
            &mut f.resources,
        );
        assert_eq!(
            f.resources.images.get(image).unwrap().layout,
            ImageLayout::ShaderRead
        );

        queue.rollback(&mut f.resources);
        assert_eq!(queue.len(), 1);
        assert_eq!(
            f.resources.images.get(image).unwrap().layout,
            ImageLayout::Undefined
        );
    }
}
