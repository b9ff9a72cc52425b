//! Per-frame counters.

use std::fmt;

/// What one call to `frame()` recorded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Serial of the submission, starting at 1
    pub frame: u64,
    pub draws_executed: u32,
    /// Draws dropped because a handle was stale or a pipeline or descriptor
    /// set could not be built
    pub draws_skipped: u32,
    pub render_passes: u32,
    pub pipeline_binds: u32,
    pub pipelines_created: u32,
    pub vertex_binds: u32,
    pub index_binds: u32,
    pub descriptor_binds: u32,
    pub descriptor_cache_hits: u32,
    pub descriptor_cache_misses: u32,
    pub buffer_copies: u32,
    pub image_copies: u32,
    /// Bytes held in the transient rings when the frame was submitted
    pub transient_bytes: u64,
    /// Objects and ring spans released after the fence wait
    pub released: u32,
}

impl fmt::Display for FrameStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "frame {}: {} draws ({} skipped), {} passes, {} pipeline binds ({} new), \
             {}/{} vb/ib binds, {} set binds ({} hits, {} misses), {}+{} copies, {} transient bytes",
            self.frame,
            self.draws_executed,
            self.draws_skipped,
            self.render_passes,
            self.pipeline_binds,
            self.pipelines_created,
            self.vertex_binds,
            self.index_binds,
            self.descriptor_binds,
            self.descriptor_cache_hits,
            self.descriptor_cache_misses,
            self.buffer_copies,
            self.image_copies,
            self.transient_bytes,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_mentions_counts() {
        let stats = FrameStats {
            frame: 3,
            draws_executed: 10,
            draws_skipped: 1,
            render_passes: 2,
            ..Default::default()
        };
        let text = stats.to_string();
        assert!(text.starts_with("frame 3: 10 draws (1 skipped), 2 passes"));
    }
}
