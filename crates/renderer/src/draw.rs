//! Draw commands accumulated between two frames.
//!
//! The `bind_*`/`set_*` calls edit the draw being built; `submit` stamps it
//! with a sort key and starts a fresh one. At frame time the list is sorted
//! by key so draws are grouped by view, then by program, in submission order
//! within a group.

use glam::Mat4;

use framekit_rhi::buffer::IndexType;

use crate::error::{RenderError, RenderResult};
use crate::handle::{
    DescriptorHandle, FramebufferHandle, IndexBufferHandle, ProgramHandle, VertexBufferHandle,
};
use crate::pipeline_cache::LayoutId;
use crate::ring::TransientAllocation;
use crate::transform::DrawTransforms;

/// Index of a view target.
pub type ViewId = u8;

/// Number of addressable views, one per [`ViewId`].
pub const MAX_VIEWS: usize = ViewId::MAX as usize + 1;

const VIEW_SHIFT: u32 = 64;
const PROGRAM_SHIFT: u32 = 32;

/// Orders draws by view, then program, then submission order.
///
/// Every field keeps its full width, so two programs never share a group
/// whatever their registry index.
pub fn sort_key(view: ViewId, program: ProgramHandle, sequence: u32) -> u128 {
    ((view as u128) << VIEW_SHIFT)
        | ((program.index() as u128) << PROGRAM_SHIFT)
        | sequence as u128
}

/// Vertices written into the transient vertex ring for one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransientVertexBuffer {
    pub(crate) allocation: TransientAllocation,
    pub(crate) layout: LayoutId,
    pub(crate) vertex_count: u32,
}

impl TransientVertexBuffer {
    /// Whole vertices in the allocation.
    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn allocation(&self) -> &TransientAllocation {
        &self.allocation
    }
}

/// Indices written into the transient index ring for one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransientIndexBuffer {
    pub(crate) allocation: TransientAllocation,
    pub(crate) index_type: IndexType,
    pub(crate) index_count: u32,
}

impl TransientIndexBuffer {
    /// Indices in the allocation.
    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub fn allocation(&self) -> &TransientAllocation {
        &self.allocation
    }
}

/// Where a draw takes its vertices from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VertexSource {
    /// No vertex input; the shader generates vertices and the draw needs
    /// an explicit count
    #[default]
    None,
    Buffer(VertexBufferHandle),
    Transient(TransientVertexBuffer),
}

/// Index stream of a draw, `None` for non-indexed draws.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IndexSource {
    #[default]
    None,
    Buffer(IndexBufferHandle),
    Transient(TransientIndexBuffer),
}

/// One submitted draw: its inputs, bindings and ordering.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DrawCommand {
    pub vertex: VertexSource,
    pub index: IndexSource,
    /// Overrides the count derived from the bound buffers
    pub vertex_count: Option<u32>,
    /// Descriptor handles of each user slot, in binding order
    pub slots: Vec<Vec<DescriptorHandle>>,
    pub transforms: DrawTransforms,
    pub view: ViewId,
    pub program: Option<ProgramHandle>,
    pub sort_key: u128,
    /// Position in submission order; selects the draw's transforms
    pub sequence: u32,
}

impl DrawCommand {
    /// Non-empty descriptor slots with their index.
    pub fn bound_slots(&self) -> impl Iterator<Item = (usize, &[DescriptorHandle])> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, handles)| !handles.is_empty())
            .map(|(slot, handles)| (slot, handles.as_slice()))
    }

    /// Every bound descriptor, slot by slot.
    pub fn descriptors(&self) -> impl Iterator<Item = DescriptorHandle> + '_ {
        self.slots.iter().flatten().copied()
    }
}

/// Destination and clear policy of a view.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ViewTarget {
    /// `None` renders to the backbuffer
    pub framebuffer: Option<FramebufferHandle>,
    pub clear_color: [f32; 4],
    pub clear_enabled: bool,
}

impl Default for ViewTarget {
    fn default() -> Self {
        Self {
            framebuffer: None,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            clear_enabled: true,
        }
    }
}

impl ViewTarget {
    /// Clear color applied when the view's pass begins, if clearing is on.
    pub fn clear(&self) -> Option<[f32; 4]> {
        self.clear_enabled.then_some(self.clear_color)
    }
}

/// Target and clear policy of all [`MAX_VIEWS`] views.
pub struct Views {
    targets: Vec<ViewTarget>,
}

impl Default for Views {
    fn default() -> Self {
        Self::new()
    }
}

impl Views {
    /// Every view renders to the backbuffer and clears to opaque black.
    pub fn new() -> Self {
        Self {
            targets: vec![ViewTarget::default(); MAX_VIEWS],
        }
    }

    pub fn get(&self, view: ViewId) -> &ViewTarget {
        &self.targets[view as usize]
    }

    pub fn set_target(&mut self, view: ViewId, framebuffer: Option<FramebufferHandle>) {
        self.targets[view as usize].framebuffer = framebuffer;
    }

    /// Clears to `rgba` when the view begins, or keeps the previous
    /// contents with `None`. The last color is remembered when disabled.
    pub fn set_clear(&mut self, view: ViewId, rgba: Option<[f32; 4]>) {
        let target = &mut self.targets[view as usize];
        target.clear_enabled = rgba.is_some();
        if let Some(rgba) = rgba {
            target.clear_color = rgba;
        }
    }

    /// Points every view rendering into `framebuffer` back at the backbuffer.
    pub fn detach_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        for target in &mut self.targets {
            if target.framebuffer == Some(framebuffer) {
                target.framebuffer = None;
            }
        }
    }
}

/// Pending draws of the next frame plus the draw being built.
///
/// Bounded by `max_draws` so the transform buffer, sized once at startup,
/// always has room for every draw.
pub struct DrawList {
    commands: Vec<DrawCommand>,
    current: DrawCommand,
    max_draws: usize,
    max_slots: usize,
    max_bindings_per_set: usize,
}

impl DrawList {
    pub fn new(max_draws: usize, max_slots: usize, max_bindings_per_set: usize) -> Self {
        Self {
            commands: Vec::with_capacity(max_draws),
            current: DrawCommand::default(),
            max_draws,
            max_slots,
            max_bindings_per_set,
        }
    }

    pub fn bind_vertex_buffer(&mut self, handle: VertexBufferHandle) {
        self.current.vertex = VertexSource::Buffer(handle);
    }

    pub fn bind_transient_vertex_buffer(&mut self, buffer: TransientVertexBuffer) {
        self.current.vertex = VertexSource::Transient(buffer);
    }

    pub fn bind_index_buffer(&mut self, handle: IndexBufferHandle) {
        self.current.index = IndexSource::Buffer(handle);
    }

    pub fn bind_transient_index_buffer(&mut self, buffer: TransientIndexBuffer) {
        self.current.index = IndexSource::Transient(buffer);
    }

    pub fn set_vertex_count(&mut self, count: u32) {
        self.current.vertex_count = Some(count);
    }

    /// Appends `descriptor` to user slot `slot` of the current draw.
    pub fn bind_descriptor(&mut self, slot: usize, descriptor: DescriptorHandle) -> RenderResult<()> {
        if slot >= self.max_slots {
            return Err(RenderError::capacity("descriptor slots", self.max_slots));
        }
        if self.current.slots.len() <= slot {
            self.current.slots.resize_with(slot + 1, Vec::new);
        }
        let handles = &mut self.current.slots[slot];
        if handles.len() >= self.max_bindings_per_set {
            return Err(RenderError::capacity(
                "descriptor bindings per set",
                self.max_bindings_per_set,
            ));
        }
        handles.push(descriptor);
        Ok(())
    }

    pub fn set_transform(&mut self, model: Mat4) {
        self.current.transforms.model = model;
    }

    pub fn set_view(&mut self, view: Mat4) {
        self.current.transforms.view = view;
    }

    pub fn set_proj(&mut self, proj: Mat4) {
        self.current.transforms.proj = proj;
    }

    /// Finalizes the current draw for `view` with `program`.
    ///
    /// # Errors
    ///
    /// [`RenderError::CapacityExceeded`] once `max_draws` draws are pending;
    /// the current draw is kept so the caller may retry after a frame.
    pub fn submit(&mut self, view: ViewId, program: ProgramHandle) -> RenderResult<()> {
        if self.commands.len() >= self.max_draws {
            return Err(RenderError::capacity("draws", self.max_draws));
        }
        let sequence = self.commands.len() as u32;
        let mut draw = std::mem::take(&mut self.current);
        draw.view = view;
        draw.program = Some(program);
        draw.sequence = sequence;
        draw.sort_key = sort_key(view, program, sequence);
        self.commands.push(draw);
        Ok(())
    }

    /// Stable sort by key.
    pub fn sort(&mut self) {
        self.commands.sort_by_key(|draw| draw.sort_key);
    }

    /// Transforms of every submitted draw, indexed by sequence.
    pub fn transforms(&self) -> Vec<DrawTransforms> {
        let mut transforms = vec![DrawTransforms::default(); self.commands.len()];
        for draw in &self.commands {
            transforms[draw.sequence as usize] = draw.transforms;
        }
        transforms
    }

    /// Submitted draws, sorted once [`sort`](Self::sort) has run.
    pub fn commands(&self) -> &[DrawCommand] {
        &self.commands
    }

    /// The draw being built by the `bind_*`/`set_*` calls.
    pub fn current(&self) -> &DrawCommand {
        &self.current
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Drops every submitted draw and the draw being built.
    pub fn clear(&mut self) {
        self.commands.clear();
        self.current = DrawCommand::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{Descriptor, Program, Registry};

    fn programs(count: usize) -> Vec<ProgramHandle> {
        let mut registry: Registry<Program, ()> = Registry::new();
        (0..count).map(|_| registry.insert(())).collect()
    }

    #[test]
    fn test_sort_key_fields() {
        let programs = programs(3);
        let p2 = programs[2];
        let key = sort_key(5, p2, 9);

        assert_eq!(key >> 64, 5);
        assert_eq!((key >> 32) as u32, 2);
        assert_eq!(key as u32, 9);
        assert!(sort_key(0, p2, 0) < sort_key(1, programs[0], 0));
        assert!(sort_key(1, programs[0], 100) < sort_key(1, programs[1], 0));
    }

    #[test]
    fn test_sort_key_separates_distant_programs() {
        let programs = programs(0x1_0001);
        let (low, high) = (programs[0], programs[0x1_0000]);

        assert_ne!(sort_key(0, low, 0), sort_key(0, high, 0));
        assert!(sort_key(0, low, 7) < sort_key(0, high, 0));
        assert!(sort_key(0, high, u32::MAX) < sort_key(1, low, 0));
    }

    #[test]
    fn test_submit_resets_current_draw() {
        let [p] = programs(1)[..] else { unreachable!() };
        let mut list = DrawList::new(8, 2, 2);
        list.set_transform(Mat4::from_scale(glam::Vec3::splat(2.0)));
        list.set_vertex_count(3);
        list.submit(0, p).unwrap();

        assert_eq!(list.len(), 1);
        assert_eq!(list.current(), &DrawCommand::default());
        assert_eq!(list.commands()[0].vertex_count, Some(3));
        assert_eq!(list.commands()[0].program, Some(p));
    }

    #[test]
    fn test_sort_groups_by_view_then_program_keeping_order() {
        let [p0, p1] = programs(2)[..] else { unreachable!() };
        let mut list = DrawList::new(16, 1, 1);
        let submissions = [(1, p1), (0, p1), (1, p0), (0, p0), (1, p1), (0, p1)];
        for (view, program) in submissions {
            list.submit(view, program).unwrap();
        }
        list.sort();

        let order: Vec<_> = list
            .commands()
            .iter()
            .map(|d| (d.view, d.program.unwrap().index(), d.sequence))
            .collect();
        assert_eq!(
            order,
            vec![
                (0, 0, 3),
                (0, 1, 1),
                (0, 1, 5),
                (1, 0, 2),
                (1, 1, 0),
                (1, 1, 4),
            ]
        );
    }

    #[test]
    fn test_transforms_follow_submission_order() {
        let [p0, p1] = programs(2)[..] else { unreachable!() };
        let mut list = DrawList::new(4, 1, 1);
        for (i, program) in [p1, p0, p1].into_iter().enumerate() {
            list.set_transform(Mat4::from_translation(glam::Vec3::X * i as f32));
            list.submit(0, program).unwrap();
        }
        list.sort();

        let transforms = list.transforms();
        for (i, t) in transforms.iter().enumerate() {
            assert_eq!(t.model.w_axis.x, i as f32);
        }
    }

    #[test]
    fn test_draw_capacity() {
        let [p] = programs(1)[..] else { unreachable!() };
        let mut list = DrawList::new(2, 1, 1);
        list.submit(0, p).unwrap();
        list.submit(0, p).unwrap();

        assert!(matches!(
            list.submit(0, p),
            Err(RenderError::CapacityExceeded { resource: "draws", limit: 2 })
        ));
        list.clear();
        assert!(list.submit(0, p).is_ok());
    }

    #[test]
    fn test_descriptor_limits() {
        let mut registry: Registry<Descriptor, ()> = Registry::new();
        let d = registry.insert(());
        let mut list = DrawList::new(2, 2, 2);

        list.bind_descriptor(1, d).unwrap();
        list.bind_descriptor(1, d).unwrap();
        assert!(list.bind_descriptor(1, d).is_err());
        assert!(list.bind_descriptor(2, d).is_err());

        let slots: Vec<_> = list.current().bound_slots().map(|(slot, h)| (slot, h.len())).collect();
        assert_eq!(slots, vec![(1, 2)]);
    }

    #[test]
    fn test_views_default_to_cleared_backbuffer() {
        let mut views = Views::new();
        assert_eq!(views.get(255).framebuffer, None);
        assert_eq!(views.get(0).clear(), Some([0.0, 0.0, 0.0, 1.0]));

        views.set_clear(3, Some([1.0, 0.0, 0.0, 1.0]));
        views.set_clear(4, None);
        assert_eq!(views.get(3).clear(), Some([1.0, 0.0, 0.0, 1.0]));
        assert_eq!(views.get(4).clear(), None);

        views.set_clear(3, None);
        assert_eq!(views.get(3).clear(), None);
        assert_eq!(views.get(3).clear_color, [1.0, 0.0, 0.0, 1.0]);
    }
}
