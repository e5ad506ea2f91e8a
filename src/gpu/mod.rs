//! GPU context and driver seam.
//!
//! The compositor core drives the GPU through the [`GpuDriver`] trait so the
//! engine and display loop can run against the real Vulkan driver on device
//! and against a recording mock in tests. Handles crossing the seam are
//! opaque 64-bit ids (the Vulkan implementation stores its dispatchable
//! handles in them directly).

pub mod mock;
pub mod vulkan;

use std::os::unix::io::RawFd;

use ash::vk;
use thiserror::Error;

use crate::core::protocol::Extent2d;

/// Frame slots rotated by the display loop.
pub const FRAMES_IN_FLIGHT: usize = 3;

/// Upper bound on platform swapchain images.
pub const MAX_SWAPCHAIN_IMAGES: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemaphoreId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlatformBufferId(pub u64);

/// Opaque platform window reference, forwarded verbatim to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowHandle(pub usize);

#[derive(Error, Debug)]
pub enum GpuError {
    #[error("vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    #[error("format {0} has no platform buffer equivalent")]
    UnsupportedFormat(i32),

    #[error("platform buffers are not available on this target")]
    PlatformBufferUnsupported,

    #[error("no display swapchain")]
    NoSwapchain,

    #[error("display swapchain is out of date")]
    OutOfDate,

    #[error("platform buffer transfer failed: {0}")]
    HandleTransfer(nix::Error),

    #[error("{0}")]
    Driver(String),
}

pub type GpuResult<T> = std::result::Result<T, GpuError>;

/// Maps a `VkFormat` raw value onto the platform buffer pixel format used to
/// back client images. The map is closed: anything outside it fails
/// allocation synchronously.
pub fn platform_buffer_format(format: i32) -> Option<u32> {
    // AHARDWAREBUFFER_FORMAT_* values.
    const R8G8B8A8_UNORM: u32 = 1;
    const R8G8B8_UNORM: u32 = 3;
    const R5G6B5_UNORM: u32 = 4;
    const R16G16B16A16_FLOAT: u32 = 0x16;
    const R10G10B10A2_UNORM: u32 = 0x2b;
    const R8_UNORM: u32 = 0x38;

    match vk::Format::from_raw(format) {
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB => Some(R8G8B8A8_UNORM),
        vk::Format::R8G8B8_UNORM => Some(R8G8B8_UNORM),
        vk::Format::R5G6B5_UNORM_PACK16 => Some(R5G6B5_UNORM),
        vk::Format::R16G16B16A16_SFLOAT => Some(R16G16B16A16_FLOAT),
        vk::Format::A2R10G10B10_UNORM_PACK32 => Some(R10G10B10A2_UNORM),
        vk::Format::R8_UNORM => Some(R8_UNORM),
        _ => None,
    }
}

/// Driver seam between the compositor core and the GPU.
///
/// Resource calls are made under the engine lock, display swapchain calls
/// under the surface lock, and frame calls from the display thread only.
/// Queue submission and presentation are serialized inside the driver; the
/// single graphics+compute queue is not thread-safe.
pub trait GpuDriver: Send + Sync {
    // Client swapchain resources.

    /// Creates an image suitable for import of a platform buffer
    /// (external-memory `pNext`, transfer-source usage added).
    fn create_client_image(&self, format: i32, extent: Extent2d, usage: u32)
        -> GpuResult<ImageId>;

    /// Allocates a shared platform GPU buffer matching the image.
    fn allocate_platform_buffer(&self, format: i32, extent: Extent2d)
        -> GpuResult<PlatformBufferId>;

    /// Transmits the buffer's handle over the connected socket using the
    /// platform's out-of-band primitive (not the generic fd channel).
    fn send_platform_buffer(&self, buffer: PlatformBufferId, socket: RawFd) -> GpuResult<()>;

    /// Imports the platform buffer as device memory and binds it to the
    /// image; returns the memory object.
    fn import_platform_buffer(&self, image: ImageId, buffer: PlatformBufferId)
        -> GpuResult<MemoryId>;

    /// Creates an unsignaled binary semaphore.
    fn create_semaphore(&self) -> GpuResult<SemaphoreId>;

    /// Temporarily imports a sync-file fd into the semaphore. Ownership of
    /// `fd` moves to this call in every case; `-1` imports the
    /// already-signaled state.
    fn import_semaphore_sync_fd(&self, semaphore: SemaphoreId, fd: RawFd) -> GpuResult<()>;

    fn destroy_image(&self, image: ImageId);
    fn free_memory(&self, memory: MemoryId);
    fn release_platform_buffer(&self, buffer: PlatformBufferId);
    fn destroy_semaphore(&self, semaphore: SemaphoreId);

    // Display swapchain.

    /// (Re)creates the platform swapchain for `window`, replacing any
    /// previous one, and returns the surface extent.
    fn create_display_swapchain(&self, window: WindowHandle) -> GpuResult<Extent2d>;

    fn destroy_display_swapchain(&self);

    // Per-frame operations, in call order.

    /// Waits for the slot's previous composition to retire, then begins the
    /// slot's command buffer.
    fn begin_frame(&self, slot: usize) -> GpuResult<()>;

    /// Acquires a platform image, signaling the slot's acquire semaphore.
    fn acquire_display_image(&self, slot: usize) -> GpuResult<u32>;

    /// Records the one-per-epoch layout transition of every platform image
    /// from UNDEFINED to PRESENT_SRC.
    fn record_display_layout_transition(&self, slot: usize);

    /// Records the write-read hazard barrier and the full-extent blit of a
    /// client buffer into the acquired platform image (GENERAL to
    /// PRESENT_SRC, nearest filter).
    fn record_blit(
        &self,
        slot: usize,
        src: ImageId,
        src_extent: Extent2d,
        display_image: u32,
        dst_extent: Extent2d,
    );

    /// Ends the slot's command buffer, submits it waiting on the slot's
    /// acquire semaphore plus `waits`, signaling the slot's client-present
    /// semaphore and the image's present-ready semaphore, then presents.
    fn submit_and_present(&self, slot: usize, display_image: u32, waits: &[SemaphoreId])
        -> GpuResult<()>;

    /// Exports the slot's client-present semaphore as a sync-file fd. The
    /// caller owns the returned descriptor.
    fn export_present_fence(&self, slot: usize) -> GpuResult<RawFd>;

    fn wait_idle(&self);
}
