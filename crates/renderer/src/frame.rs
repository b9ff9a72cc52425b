//! Frames in flight and deferred destruction.
//!
//! The pacer owns [`MAX_FRAMES_IN_FLIGHT`] frame slots. Each slot has the
//! backend frame (command buffer, fence, semaphores), the storage buffer
//! holding the per-draw transforms and the descriptor set pointing at it.
//!
//! Every submission gets a serial. Objects destroyed by the caller, and
//! transient ring spans, are tagged with the serial of the next submission
//! and released once the fence of a slot that carried that serial or a
//! later one has been waited on. The queue is single-threaded and serials
//! complete in submission order, so releasing is a FIFO pop.

use std::collections::VecDeque;

use tracing::{debug, info, warn};

use crate::MAX_FRAMES_IN_FLIGHT;
use crate::backend::{Backend, BufferDesc};
use crate::error::RenderResult;
use crate::ring::{TransientAllocation, TransientPools};
use crate::transform::transform_buffer_size;
use framekit_rhi::buffer::BufferUsage;

/// A native object or ring span waiting for the GPU to let go of it.
pub enum Retired<B: Backend> {
    Buffer(B::Buffer),
    Image(B::Image),
    Sampler(B::Sampler),
    Shader(B::Shader),
    ProgramLayout(B::ProgramLayout),
    Pipeline(B::Pipeline),
    DescriptorSet(B::DescriptorSet),
    Transient(TransientAllocation),
}

impl<B: Backend> Retired<B> {
    fn release(self, backend: &mut B, pools: &mut TransientPools<B>) {
        match self {
            Retired::Buffer(buffer) => backend.destroy_buffer(buffer),
            Retired::Image(image) => backend.destroy_image(image),
            Retired::Sampler(sampler) => backend.destroy_sampler(sampler),
            Retired::Shader(shader) => backend.destroy_shader(shader),
            Retired::ProgramLayout(layout) => backend.destroy_program_layout(layout),
            Retired::Pipeline(pipeline) => backend.destroy_pipeline(pipeline),
            Retired::DescriptorSet(set) => backend.free_descriptor_set(set),
            Retired::Transient(allocation) => {
                if let Err(e) = pools.free(&allocation) {
                    warn!("Failed to release {} span: {}", allocation.pool, e);
                }
            }
        }
    }
}

/// FIFO of retired objects tagged with the serial that last used them.
pub struct RetireQueue<B: Backend> {
    items: VecDeque<(u64, Retired<B>)>,
}

impl<B: Backend> Default for RetireQueue<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> RetireQueue<B> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }

    /// Queues `item` for release after submission `serial` completes.
    /// Serials must not decrease.
    pub fn push(&mut self, serial: u64, item: Retired<B>) {
        debug_assert!(self.items.back().is_none_or(|(last, _)| *last <= serial));
        self.items.push_back((serial, item));
    }

    /// Releases everything tagged with `completed` or earlier.
    pub fn release_through(
        &mut self,
        completed: u64,
        backend: &mut B,
        pools: &mut TransientPools<B>,
    ) -> u32 {
        let mut released = 0;
        while let Some((serial, _)) = self.items.front() {
            if *serial > completed {
                break;
            }
            if let Some((_, item)) = self.items.pop_front() {
                item.release(backend, pools);
                released += 1;
            }
        }
        released
    }

    /// Releases everything regardless of serial; only valid once the
    /// device is idle.
    pub fn release_all(&mut self, backend: &mut B, pools: &mut TransientPools<B>) -> u32 {
        self.release_through(u64::MAX, backend, pools)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Per-frame state reused every [`MAX_FRAMES_IN_FLIGHT`] frames.
pub struct FrameSlot<B: Backend> {
    pub frame: B::Frame,
    /// Serial of the last submission recorded in this slot, 0 if none
    pub serial: u64,
    /// Host-visible storage buffer of the frame's [`DrawTransforms`](crate::transform::DrawTransforms)
    pub transforms: B::Buffer,
    /// Descriptor set 0, pointing at `transforms`
    pub transform_set: B::DescriptorSet,
}

impl<B: Backend> FrameSlot<B> {
    fn new(backend: &mut B, max_draws: usize) -> RenderResult<Self> {
        let transforms = backend.create_buffer(&BufferDesc {
            size: transform_buffer_size(max_draws),
            usage: BufferUsage::Storage,
            host_visible: true,
        })?;
        let transform_set = match backend.create_transform_set(&transforms) {
            Ok(set) => set,
            Err(e) => {
                backend.destroy_buffer(transforms);
                return Err(e.into());
            }
        };
        let frame = match backend.create_frame() {
            Ok(frame) => frame,
            Err(e) => {
                backend.free_descriptor_set(transform_set);
                backend.destroy_buffer(transforms);
                return Err(e.into());
            }
        };
        Ok(Self {
            frame,
            serial: 0,
            transforms,
            transform_set,
        })
    }

    fn destroy(self, backend: &mut B) {
        backend.free_descriptor_set(self.transform_set);
        backend.destroy_buffer(self.transforms);
        backend.destroy_frame(self.frame);
    }
}

/// Round-robin frame slots, submission serials and the retire queue.
///
/// # Frame Lifecycle
///
/// ```text
/// wait_current -> record into current_slot -> submit
///     -> mark_submitted (only if the submission carried the frame's work)
///     -> present -> advance
/// ```
pub struct FramePacer<B: Backend> {
    slots: Vec<FrameSlot<B>>,
    current: usize,
    submitted: u64,
    retire: RetireQueue<B>,
    pending_resize: Option<(u32, u32)>,
}

impl<B: Backend> FramePacer<B> {
    /// Creates [`MAX_FRAMES_IN_FLIGHT`] slots, each with a transform buffer
    /// sized for `max_draws`.
    ///
    /// # Errors
    ///
    /// Returns the backend error of the first slot that cannot be created;
    /// the slots created before it are destroyed again.
    pub fn new(backend: &mut B, max_draws: usize) -> RenderResult<Self> {
        let mut slots = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        for i in 0..MAX_FRAMES_IN_FLIGHT {
            match FrameSlot::new(backend, max_draws) {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    for slot in slots {
                        slot.destroy(backend);
                    }
                    return Err(e);
                }
            }
            debug!("Created frame slot {}", i);
        }

        info!(
            "Frame pacer created with {} frames in flight",
            MAX_FRAMES_IN_FLIGHT
        );

        Ok(Self {
            slots,
            current: 0,
            submitted: 0,
            retire: RetireQueue::new(),
            pending_resize: None,
        })
    }

    #[inline]
    pub fn current_slot(&self) -> &FrameSlot<B> {
        &self.slots[self.current]
    }

    #[inline]
    pub fn current_index(&self) -> usize {
        self.current
    }

    /// Serial of the most recent submission, 0 before the first.
    #[inline]
    pub fn submitted_serial(&self) -> u64 {
        self.submitted
    }

    /// Blocks until the current slot's previous submission has completed,
    /// then releases everything it was the last user of.
    pub fn wait_current(&mut self, backend: &mut B, pools: &mut TransientPools<B>) -> RenderResult<u32> {
        let slot = &self.slots[self.current];
        backend.wait_for_frame(&slot.frame)?;
        Ok(self.retire.release_through(slot.serial, backend, pools))
    }

    /// Defers release of `item` until the next submission has completed.
    pub fn retire(&mut self, item: Retired<B>) {
        self.retire.push(self.submitted + 1, item);
    }

    /// [`retire`](Self::retire) for each item.
    pub fn retire_all(&mut self, items: impl IntoIterator<Item = Retired<B>>) {
        for item in items {
            self.retire(item);
        }
    }

    /// Items waiting in the retire queue.
    pub fn pending_releases(&self) -> usize {
        self.retire.len()
    }

    /// Stamps the current slot with a new serial after a successful submit.
    pub fn mark_submitted(&mut self) -> u64 {
        self.submitted += 1;
        self.slots[self.current].serial = self.submitted;
        self.submitted
    }

    /// Moves on to the next slot.
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
    }

    /// Records a swapchain rebuild for the start of the next frame. A later
    /// explicit extent replaces an earlier one.
    pub fn request_resize(&mut self, width: u32, height: u32) {
        self.pending_resize = Some((width, height));
    }

    /// Flags a rebuild at the current extent unless one is already pending.
    pub fn request_rebuild(&mut self, extent: (u32, u32)) {
        self.pending_resize.get_or_insert(extent);
    }

    #[inline]
    pub fn pending_resize(&self) -> Option<(u32, u32)> {
        self.pending_resize
    }

    /// Drops the pending rebuild once the swapchain was recreated.
    pub fn clear_resize(&mut self) {
        self.pending_resize = None;
    }

    /// Releases every retired object and the frame slots. The device must be idle.
    pub fn destroy(mut self, backend: &mut B, pools: &mut TransientPools<B>) -> u32 {
        let released = self.retire.release_all(backend, pools);
        for slot in self.slots {
            slot.destroy(backend);
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::ring::TransientPool;

    fn setup() -> (HeadlessBackend, TransientPools<HeadlessBackend>) {
        let mut backend = HeadlessBackend::new(8, 8);
        let pools = TransientPools::new(&mut backend, 256, 256, 256, 16).unwrap();
        (backend, pools)
    }

    #[test]
    fn test_max_frames_in_flight_constant() {
        assert!(MAX_FRAMES_IN_FLIGHT >= 1);
        assert!(MAX_FRAMES_IN_FLIGHT <= 4);
    }

    #[test]
    fn test_release_through_respects_serials() {
        let (mut backend, mut pools) = setup();
        let mut queue: RetireQueue<HeadlessBackend> = RetireQueue::new();
        for serial in [1, 1, 2, 3] {
            let buffer = backend
                .create_buffer(&BufferDesc {
                    size: 4,
                    usage: BufferUsage::Uniform,
                    host_visible: true,
                })
                .unwrap();
            queue.push(serial, Retired::Buffer(buffer));
        }

        assert_eq!(queue.release_through(0, &mut backend, &mut pools), 0);
        assert_eq!(queue.release_through(1, &mut backend, &mut pools), 2);
        assert_eq!(queue.release_through(2, &mut backend, &mut pools), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.release_all(&mut backend, &mut pools), 1);
        assert_eq!(backend.live_objects().buffers, 3);
    }

    #[test]
    fn test_transient_spans_return_to_ring() {
        let (mut backend, mut pools) = setup();
        let mut queue: RetireQueue<HeadlessBackend> = RetireQueue::new();
        let a = pools.allocate(TransientPool::Staging, 100).unwrap();
        let b = pools.allocate(TransientPool::Staging, 100).unwrap();
        queue.push(1, Retired::Transient(a));
        queue.push(2, Retired::Transient(b));

        queue.release_through(1, &mut backend, &mut pools);
        assert_eq!(pools.ring(TransientPool::Staging).live_count(), 1);
        queue.release_through(2, &mut backend, &mut pools);
        assert_eq!(pools.usage().staging, 0);
    }

    #[test]
    fn test_pacer_serials_and_retirement() {
        let (mut backend, mut pools) = setup();
        let mut pacer = FramePacer::new(&mut backend, 16).unwrap();
        let baseline = backend.live_objects().buffers;

        let span = pools.allocate(TransientPool::Vertex, 64).unwrap();
        pacer.retire(Retired::Transient(span));

        // Frame 1 in slot 0 carries the span.
        pacer.wait_current(&mut backend, &mut pools).unwrap();
        assert_eq!(pacer.mark_submitted(), 1);
        pacer.advance();

        // Slot 1 has never been submitted; nothing completes yet.
        assert_eq!(pacer.wait_current(&mut backend, &mut pools).unwrap(), 0);
        assert_eq!(pacer.mark_submitted(), 2);
        pacer.advance();

        // Back in slot 0: serial 1 is done.
        assert_eq!(pacer.current_index(), 0);
        assert_eq!(pacer.wait_current(&mut backend, &mut pools).unwrap(), 1);
        assert_eq!(pools.usage().vertex, 0);

        pacer.destroy(&mut backend, &mut pools);
        assert_eq!(
            backend.live_objects().buffers,
            baseline - MAX_FRAMES_IN_FLIGHT
        );
        assert_eq!(backend.live_objects().frames, 0);
    }

    #[test]
    fn test_resize_requests() {
        let (mut backend, _pools) = setup();
        let mut pacer = FramePacer::new(&mut backend, 1).unwrap();

        pacer.request_rebuild((8, 8));
        pacer.request_rebuild((4, 4));
        assert_eq!(pacer.pending_resize(), Some((8, 8)));
        pacer.request_resize(640, 480);
        assert_eq!(pacer.pending_resize(), Some((640, 480)));
        pacer.clear_resize();
        assert_eq!(pacer.pending_resize(), None);
    }
}
