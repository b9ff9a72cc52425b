//! Lazily built graphics pipelines.
//!
//! A pipeline depends on more than its program: the vertex input layout of
//! the bound vertex stream and the attachment formats of the pass it is
//! used in are baked into it. Pipelines are therefore cached per
//! [`PipelineKey`], so a program drawn into two targets with the same
//! formats shares one pipeline while a target with different formats gets
//! its own.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use framekit_rhi::image::Format;
use framekit_rhi::vertex::VertexLayout;

use crate::handle::ProgramHandle;

/// Interned [`VertexLayout`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LayoutId(u32);

/// Everything a pipeline is specialized for.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub program: ProgramHandle,
    /// `None` for draws without vertex input
    pub vertex_layout: Option<LayoutId>,
    pub color_formats: Vec<Format>,
    pub depth_format: Option<Format>,
}

impl PipelineKey {
    /// Whether the key was built for a pass with these attachment formats.
    pub fn uses_formats(&self, colors: &[Format], depth: Option<Format>) -> bool {
        self.color_formats == colors && self.depth_format == depth
    }
}

/// Pipelines keyed by [`PipelineKey`], plus the interned vertex layouts.
///
/// Layouts are never removed; their number stays small in practice.
pub struct PipelineCache<P> {
    pipelines: HashMap<PipelineKey, P>,
    layouts: Vec<VertexLayout>,
    layout_ids: HashMap<VertexLayout, LayoutId>,
}

impl<P> Default for PipelineCache<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> PipelineCache<P> {
    pub fn new() -> Self {
        Self {
            pipelines: HashMap::new(),
            layouts: Vec::new(),
            layout_ids: HashMap::new(),
        }
    }

    /// Returns the id of `layout`, registering it on first sight.
    pub fn intern_layout(&mut self, layout: &VertexLayout) -> LayoutId {
        if let Some(&id) = self.layout_ids.get(layout) {
            return id;
        }
        let id = LayoutId(self.layouts.len() as u32);
        self.layouts.push(layout.clone());
        self.layout_ids.insert(layout.clone(), id);
        id
    }

    /// The layout interned as `id`.
    pub fn layout(&self, id: LayoutId) -> Option<&VertexLayout> {
        self.layouts.get(id.0 as usize)
    }

    pub fn get(&self, key: &PipelineKey) -> Option<&P> {
        self.pipelines.get(key)
    }

    /// Returns the pipeline for `key`, building it with `build` on a miss.
    /// The flag is true when the pipeline was just built.
    pub fn get_or_try_insert_with<E>(
        &mut self,
        key: PipelineKey,
        build: impl FnOnce(Option<&VertexLayout>) -> Result<P, E>,
    ) -> Result<(&P, bool), E> {
        match self.pipelines.entry(key) {
            Entry::Occupied(entry) => Ok((entry.into_mut(), false)),
            Entry::Vacant(entry) => {
                let layout = entry
                    .key()
                    .vertex_layout
                    .and_then(|id| self.layouts.get(id.0 as usize));
                let pipeline = build(layout)?;
                Ok((entry.insert(pipeline), true))
            }
        }
    }

    /// Removes every pipeline matching `predicate`.
    pub fn evict_where(&mut self, mut predicate: impl FnMut(&PipelineKey) -> bool) -> Vec<P> {
        let keys: Vec<_> = self
            .pipelines
            .keys()
            .filter(|key| predicate(key))
            .cloned()
            .collect();
        keys.iter()
            .filter_map(|key| self.pipelines.remove(key))
            .collect()
    }

    /// Removes the pipelines of `program` and returns them for release.
    pub fn evict_program(&mut self, program: ProgramHandle) -> Vec<P> {
        self.evict_where(|key| key.program == program)
    }

    /// Empties the cache; layouts stay interned.
    pub fn drain(&mut self) -> Vec<P> {
        self.pipelines.drain().map(|(_, pipeline)| pipeline).collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{Program, Registry};
    use framekit_rhi::vertex::VertexFormat;

    fn programs(count: usize) -> Vec<ProgramHandle> {
        let mut registry: Registry<Program, ()> = Registry::new();
        (0..count).map(|_| registry.insert(())).collect()
    }

    fn key(program: ProgramHandle, color: Format) -> PipelineKey {
        PipelineKey {
            program,
            vertex_layout: None,
            color_formats: vec![color],
            depth_format: Some(Format::Depth32Float),
        }
    }

    #[test]
    fn test_layouts_are_interned() {
        let mut cache: PipelineCache<u32> = PipelineCache::new();
        let a = VertexLayout::new().push(VertexFormat::Float3);
        let b = VertexLayout::new().push(VertexFormat::Float2);

        let id_a = cache.intern_layout(&a);
        assert_eq!(cache.intern_layout(&a.clone()), id_a);
        assert_ne!(cache.intern_layout(&b), id_a);
        assert_eq!(cache.layout(id_a), Some(&a));
    }

    #[test]
    fn test_build_once_per_key() {
        let mut cache: PipelineCache<u32> = PipelineCache::new();
        let [p] = programs(1)[..] else { unreachable!() };
        let mut builds = 0;

        for _ in 0..3 {
            let (pipeline, _) = cache
                .get_or_try_insert_with(key(p, Format::Bgra8Srgb), |_| {
                    builds += 1;
                    Ok::<_, ()>(7)
                })
                .unwrap();
            assert_eq!(*pipeline, 7);
        }
        cache
            .get_or_try_insert_with(key(p, Format::Rgba16Float), |_| {
                builds += 1;
                Ok::<_, ()>(8)
            })
            .unwrap();

        assert_eq!(builds, 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_failed_build_is_not_cached() {
        let mut cache: PipelineCache<u32> = PipelineCache::new();
        let [p] = programs(1)[..] else { unreachable!() };

        let result = cache.get_or_try_insert_with(key(p, Format::Bgra8Srgb), |_| Err("boom"));
        assert_eq!(result.err(), Some("boom"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_build_sees_vertex_layout() {
        let mut cache: PipelineCache<u32> = PipelineCache::new();
        let [p] = programs(1)[..] else { unreachable!() };
        let layout = VertexLayout::new()
            .push(VertexFormat::Float3)
            .push(VertexFormat::Float2);
        let id = cache.intern_layout(&layout);

        let mut seen_stride = None;
        cache
            .get_or_try_insert_with(
                PipelineKey {
                    vertex_layout: Some(id),
                    ..key(p, Format::Bgra8Srgb)
                },
                |layout| {
                    seen_stride = layout.map(VertexLayout::stride);
                    Ok::<_, ()>(1)
                },
            )
            .unwrap();
        assert_eq!(seen_stride, Some(20));
    }

    #[test]
    fn test_evict_program_and_formats() {
        let mut cache: PipelineCache<u32> = PipelineCache::new();
        let [p1, p2] = programs(2)[..] else { unreachable!() };
        for (program, format, value) in [
            (p1, Format::Bgra8Srgb, 1),
            (p1, Format::Rgba16Float, 2),
            (p2, Format::Bgra8Srgb, 3),
        ] {
            cache
                .get_or_try_insert_with(key(program, format), |_| Ok::<_, ()>(value))
                .unwrap();
        }

        let mut evicted = cache.evict_program(p1);
        evicted.sort();
        assert_eq!(evicted, vec![1, 2]);

        let evicted = cache.evict_where(|key| {
            key.uses_formats(&[Format::Bgra8Srgb], Some(Format::Depth32Float))
        });
        assert_eq!(evicted, vec![3]);
        assert!(cache.is_empty());
    }
}
