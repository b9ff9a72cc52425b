//! Transient ring allocators.
//!
//! A [`RingBuffer`] hands out contiguous spans of one host-visible backing
//! buffer. Allocations advance `head`, frees advance `tail`, and frees must
//! arrive in allocation order. A request that does not fit between `head`
//! and the end of the buffer pads to the end and restarts at offset zero,
//! but only if the restarted span stays below `tail`; otherwise it fails.
//!
//! [`TransientPools`] pairs the three rings (transient vertex, transient
//! index, staging) with their backing buffers.

use std::collections::VecDeque;
use std::fmt;

use thiserror::Error;
use tracing::debug;

use framekit_rhi::buffer::BufferUsage;

use crate::backend::{Backend, BufferDesc};
use crate::error::{RenderError, RenderResult};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RingError {
    #[error("zero-sized allocation")]
    ZeroSize,

    #[error("{requested} bytes exceed the pool capacity of {capacity}")]
    TooLarge { requested: u64, capacity: u64 },

    #[error("{requested} bytes would overlap live data ({free} bytes free)")]
    Overflow { requested: u64, free: u64 },

    #[error("free of span at {offset} while an older span is still live")]
    OutOfOrderFree { offset: u64 },
}

/// Which ring an allocation came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransientPool {
    Vertex,
    Index,
    Staging,
}

impl TransientPool {
    /// Every pool, in the order their rings are stored.
    pub const ALL: [TransientPool; 3] = [
        TransientPool::Vertex,
        TransientPool::Index,
        TransientPool::Staging,
    ];

    /// Usage of the buffer backing the ring.
    pub fn usage(self) -> BufferUsage {
        match self {
            TransientPool::Vertex => BufferUsage::Vertex,
            TransientPool::Index => BufferUsage::Index,
            TransientPool::Staging => BufferUsage::Staging,
        }
    }
}

impl fmt::Display for TransientPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransientPool::Vertex => "transient vertex",
            TransientPool::Index => "transient index",
            TransientPool::Staging => "staging",
        })
    }
}

/// A span handed out by a [`RingBuffer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransientAllocation {
    pub pool: TransientPool,
    /// Requested size in bytes
    pub size: u64,
    /// Bytes consumed from the ring, including alignment and wrap padding
    pub actual_size: u64,
    /// Offset of the usable region in the backing buffer
    pub offset: u64,
    /// Bytes skipped at the end of the ring before wrapping to zero
    pub padding: u64,
}

/// FIFO byte ring. Spans are freed oldest first, which is the order their
/// frames retire in.
#[derive(Debug)]
pub struct RingBuffer {
    pool: TransientPool,
    capacity: u64,
    alignment: u64,
    head: u64,
    tail: u64,
    used: u64,
    // (span start, actual size) of live allocations, oldest first
    live: VecDeque<(u64, u64)>,
}

impl RingBuffer {
    /// `alignment` must be a power of two.
    pub fn new(pool: TransientPool, capacity: u64, alignment: u64) -> Self {
        debug_assert!(alignment.is_power_of_two());
        Self {
            pool,
            capacity,
            alignment: alignment.max(1),
            head: 0,
            tail: 0,
            used: 0,
            live: VecDeque::new(),
        }
    }

    /// Reserves `size` bytes at the next aligned offset, wrapping to the
    /// start when the tail end is too short.
    ///
    /// # Errors
    ///
    /// [`RingError::ZeroSize`], [`RingError::TooLarge`] for requests above
    /// the capacity, and [`RingError::Overflow`] when the span would reach
    /// bytes of a live allocation.
    pub fn allocate(&mut self, size: u64) -> Result<TransientAllocation, RingError> {
        if size == 0 {
            return Err(RingError::ZeroSize);
        }
        let aligned = align_up(size, self.alignment);
        if aligned > self.capacity {
            return Err(RingError::TooLarge {
                requested: size,
                capacity: self.capacity,
            });
        }

        if self.used == 0 {
            self.head = 0;
            self.tail = 0;
        }

        let start = self.head;
        let (offset, padding) = if self.used == 0 || self.head > self.tail {
            if aligned <= self.capacity - self.head {
                (self.head, 0)
            } else if aligned <= self.tail {
                (0, self.capacity - self.head)
            } else {
                return Err(self.overflow(size));
            }
        } else if self.head < self.tail && aligned <= self.tail - self.head {
            (self.head, 0)
        } else {
            return Err(self.overflow(size));
        };

        let actual_size = aligned + padding;
        self.head = (offset + aligned) % self.capacity;
        self.used += actual_size;
        self.live.push_back((start, actual_size));

        Ok(TransientAllocation {
            pool: self.pool,
            size,
            actual_size,
            offset,
            padding,
        })
    }

    /// Releases the oldest live allocation, which must be `allocation`.
    pub fn free(&mut self, allocation: &TransientAllocation) -> Result<(), RingError> {
        let start = if allocation.padding > 0 {
            self.capacity - allocation.padding
        } else {
            allocation.offset
        };

        match self.live.front() {
            Some(&(live_start, actual)) if live_start == start && actual == allocation.actual_size => {
                self.live.pop_front();
                self.tail = (self.tail + actual) % self.capacity;
                self.used -= actual;
                Ok(())
            }
            _ => Err(RingError::OutOfOrderFree {
                offset: allocation.offset,
            }),
        }
    }

    /// Undoes the newest allocation.
    pub(crate) fn rollback_last(&mut self) {
        if let Some((start, actual)) = self.live.pop_back() {
            self.head = start;
            self.used -= actual;
        }
    }

    fn overflow(&self, requested: u64) -> RingError {
        RingError::Overflow {
            requested,
            free: self.capacity - self.used,
        }
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes held by live allocations, padding included.
    #[inline]
    pub fn used(&self) -> u64 {
        self.used
    }

    #[inline]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    #[inline]
    pub fn head(&self) -> u64 {
        self.head
    }

    #[inline]
    pub fn tail(&self) -> u64 {
        self.tail
    }
}

#[inline]
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// Byte usage of the three transient rings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransientUsage {
    pub vertex: u64,
    pub index: u64,
    pub staging: u64,
}

impl TransientUsage {
    /// Sum over all three rings.
    pub fn total(&self) -> u64 {
        self.vertex + self.index + self.staging
    }
}

/// The three transient rings and the host-visible buffers backing them.
pub struct TransientPools<B: Backend> {
    rings: [RingBuffer; 3],
    buffers: [B::Buffer; 3],
}

impl<B: Backend> TransientPools<B> {
    /// Creates the three host-visible backing buffers and their rings.
    ///
    /// # Errors
    ///
    /// Returns the backend error if a buffer cannot be created; buffers
    /// created before it are destroyed again.
    pub fn new(
        backend: &mut B,
        vertex_size: u64,
        index_size: u64,
        staging_size: u64,
        alignment: u64,
    ) -> RenderResult<Self> {
        let sizes = [vertex_size, index_size, staging_size];
        let mut buffers = Vec::with_capacity(sizes.len());
        for (pool, size) in TransientPool::ALL.into_iter().zip(sizes) {
            let desc = BufferDesc {
                size,
                usage: pool.usage(),
                host_visible: true,
            };
            match backend.create_buffer(&desc) {
                Ok(buffer) => buffers.push(buffer),
                Err(e) => {
                    for buffer in buffers {
                        backend.destroy_buffer(buffer);
                    }
                    return Err(e.into());
                }
            }
        }
        let buffers: [B::Buffer; 3] = buffers
            .try_into()
            .map_err(|_| RenderError::InvalidArgument("transient pool setup".to_string()))?;

        debug!(
            "Transient pools: vertex {} B, index {} B, staging {} B (alignment {})",
            vertex_size, index_size, staging_size, alignment
        );

        Ok(Self {
            rings: TransientPool::ALL.map(|pool| RingBuffer::new(pool, sizes[slot(pool)], alignment)),
            buffers,
        })
    }

    /// Reserves a span in `pool` without writing it.
    pub fn allocate(&mut self, pool: TransientPool, size: u64) -> RenderResult<TransientAllocation> {
        Ok(self.rings[slot(pool)].allocate(size)?)
    }

    /// Allocates and fills a span in one step.
    pub fn allocate_with(
        &mut self,
        backend: &mut B,
        pool: TransientPool,
        data: &[u8],
    ) -> RenderResult<TransientAllocation> {
        let allocation = self.allocate(pool, data.len() as u64)?;
        if let Err(e) = backend.write_buffer(&self.buffers[slot(pool)], allocation.offset, data) {
            // Newest span, so it is the only one that can be rolled back.
            self.rings[slot(pool)].rollback_last();
            return Err(e.into());
        }
        Ok(allocation)
    }

    /// Returns a span to its ring. Spans of one pool must be freed in
    /// allocation order.
    pub fn free(&mut self, allocation: &TransientAllocation) -> RenderResult<()> {
        Ok(self.rings[slot(allocation.pool)].free(allocation)?)
    }

    #[inline]
    pub fn buffer(&self, pool: TransientPool) -> &B::Buffer {
        &self.buffers[slot(pool)]
    }

    #[inline]
    pub fn ring(&self, pool: TransientPool) -> &RingBuffer {
        &self.rings[slot(pool)]
    }

    /// Bytes currently reserved in each ring.
    pub fn usage(&self) -> TransientUsage {
        TransientUsage {
            vertex: self.rings[0].used(),
            index: self.rings[1].used(),
            staging: self.rings[2].used(),
        }
    }

    /// Destroys the backing buffers. Nothing may still read them.
    pub fn destroy(self, backend: &mut B) {
        for buffer in self.buffers {
            backend.destroy_buffer(buffer);
        }
    }
}

#[inline]
fn slot(pool: TransientPool) -> usize {
    match pool {
        TransientPool::Vertex => 0,
        TransientPool::Index => 1,
        TransientPool::Staging => 2,
    }
}
