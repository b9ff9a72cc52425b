//! Synchronization primitives.
//!
//! - [`Semaphore`] orders work between queue operations (acquire, render, present)
//! - [`Fence`] lets the host wait for submitted work
//! - [`FrameSync`] bundles the objects one frame in flight needs
//! - [`PresentSemaphores`] holds one render-complete semaphore per swapchain image
//!
//! # Overview
//!
//! A frame in flight owns its image-acquired semaphore and its release
//! fence. The render-complete semaphore is keyed by swapchain image instead:
//! waiting on a frame's fence proves its submission finished, but not that
//! the presentation engine is done waiting on the semaphore the submission
//! signaled. Re-signaling a semaphore per image avoids reusing it while a
//! present of that image may still hold it.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use framekit_rhi::device::Device;
//! use framekit_rhi::sync::{FrameSync, PresentSemaphores};
//!
//! # fn example(device: Arc<Device>, image_count: usize) -> framekit_rhi::RhiResult<()> {
//! let frame = FrameSync::new(device.clone())?;
//! let present = PresentSemaphores::new(device, image_count)?;
//!
//! frame.in_flight().wait(u64::MAX)?;
//! // acquire with frame.image_available(), submit signaling
//! // present.get(image_index), then present waiting on the same semaphore
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// Vulkan semaphore, destroyed on drop.
///
/// Used for GPU-to-GPU ordering: the swapchain signals one when an image is
/// ready, a submission signals one when rendering to that image is done.
pub struct Semaphore {
    device: Arc<Device>,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Creates an unsignaled binary semaphore.
    ///
    /// # Errors
    ///
    /// Returns an error if `vkCreateSemaphore` fails.
    pub fn new(device: Arc<Device>) -> RhiResult<Self> {
        let create_info = vk::SemaphoreCreateInfo::default();
        // SAFETY: the device is live for as long as the Arc is held here.
        let semaphore = unsafe { device.handle().create_semaphore(&create_info, None)? };
        Ok(Self { device, semaphore })
    }

    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        // SAFETY: owners wait for the device (or the fence of the last
        // submission using this semaphore) before dropping it.
        unsafe {
            self.device.handle().destroy_semaphore(self.semaphore, None);
        }
    }
}

/// Vulkan fence, destroyed on drop.
///
/// Used for GPU-to-CPU synchronization: the host waits on the fence of a
/// submission before reusing anything that submission references.
pub struct Fence {
    device: Arc<Device>,
    fence: vk::Fence,
}

impl Fence {
    /// Creates a fence.
    ///
    /// # Arguments
    ///
    /// * `device` - The logical device
    /// * `signaled` - Create the fence signaled, so the first wait on it
    ///   returns before anything was submitted
    ///
    /// # Errors
    ///
    /// Returns an error if `vkCreateFence` fails.
    pub fn new(device: Arc<Device>, signaled: bool) -> RhiResult<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };

        let create_info = vk::FenceCreateInfo::default().flags(flags);
        // SAFETY: the device is live for as long as the Arc is held here.
        let fence = unsafe { device.handle().create_fence(&create_info, None)? };

        Ok(Self { device, fence })
    }

    #[inline]
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    /// Blocks until the fence is signaled.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Timeout in nanoseconds, `u64::MAX` to wait forever
    ///
    /// # Errors
    ///
    /// Returns `vk::Result::TIMEOUT` when the timeout expires, or the error
    /// of `vkWaitForFences` (e.g. device lost).
    pub fn wait(&self, timeout: u64) -> RhiResult<()> {
        // SAFETY: the fence belongs to this device.
        unsafe {
            self.device
                .handle()
                .wait_for_fences(&[self.fence], true, timeout)?
        };
        Ok(())
    }

    /// Returns the fence to the unsignaled state.
    ///
    /// The fence must not be pending in any queue submission.
    ///
    /// # Errors
    ///
    /// Returns an error if `vkResetFences` fails.
    pub fn reset(&self) -> RhiResult<()> {
        // SAFETY: callers reset only after waiting on the fence.
        unsafe { self.device.handle().reset_fences(&[self.fence])? };
        Ok(())
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        // SAFETY: owners wait for the device before dropping fences.
        unsafe {
            self.device.handle().destroy_fence(self.fence, None);
        }
    }
}

/// Image-acquired semaphore and release fence of one frame in flight.
///
/// # Usage Pattern
///
/// ```text
/// 1. Wait for in_flight (the frame's previous submission has completed)
/// 2. Acquire a swapchain image, signaling image_available
/// 3. Reset in_flight right before submitting
/// 4. Submit: wait on image_available, signal the image's render-complete
///    semaphore and in_flight
/// 5. Present, waiting on the image's render-complete semaphore
/// ```
pub struct FrameSync {
    image_available: Semaphore,
    in_flight: Fence,
}

impl FrameSync {
    /// Creates the semaphore and a signaled fence.
    ///
    /// # Errors
    ///
    /// Returns an error if either object cannot be created.
    pub fn new(device: Arc<Device>) -> RhiResult<Self> {
        let image_available = Semaphore::new(device.clone())?;
        // Signaled so the first wait returns immediately
        let in_flight = Fence::new(device, true)?;

        debug!("Created frame synchronization primitives");

        Ok(Self {
            image_available,
            in_flight,
        })
    }

    /// Signaled by swapchain acquisition, waited on by the frame's submission.
    #[inline]
    pub fn image_available(&self) -> &Semaphore {
        &self.image_available
    }

    /// Signaled when the frame's submission has completed on the GPU.
    #[inline]
    pub fn in_flight(&self) -> &Fence {
        &self.in_flight
    }
}

/// One render-complete semaphore per swapchain image.
///
/// Rebuild it whenever the swapchain is recreated, after the device went
/// idle, since the image count may change.
pub struct PresentSemaphores {
    semaphores: Vec<Semaphore>,
}

impl PresentSemaphores {
    /// Creates `image_count` unsignaled semaphores.
    ///
    /// # Errors
    ///
    /// Returns an error if a semaphore cannot be created.
    pub fn new(device: Arc<Device>, image_count: usize) -> RhiResult<Self> {
        let semaphores = (0..image_count)
            .map(|_| Semaphore::new(device.clone()))
            .collect::<RhiResult<Vec<_>>>()?;
        debug!("Created {} render-complete semaphores", image_count);
        Ok(Self { semaphores })
    }

    /// The semaphore of swapchain image `image_index`.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::SwapchainError`] for an index past the image count.
    pub fn get(&self, image_index: u32) -> RhiResult<&Semaphore> {
        self.semaphores.get(image_index as usize).ok_or_else(|| {
            RhiError::SwapchainError(format!(
                "no render-complete semaphore for image {}",
                image_index
            ))
        })
    }

    pub fn len(&self) -> usize {
        self.semaphores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.semaphores.is_empty()
    }
}
