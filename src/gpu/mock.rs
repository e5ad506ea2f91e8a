//! Recording mock driver for tests.
//!
//! Stands in for the Vulkan driver so the engine and display loop can be
//! exercised without a GPU: every recorded blit, layout transition, and
//! submission is captured for assertions, exported "sync fds" are real
//! descriptors (duplicates of `/dev/null`) so fd-lifetime properties hold,
//! and platform buffer handles are sent as one small datagram each so the
//! out-of-band ordering of the allocation reply can be observed end to end.

use std::collections::HashSet;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use ash::vk;

use crate::core::protocol::Extent2d;
use crate::core::transport;
use crate::gpu::{
    platform_buffer_format, GpuDriver, GpuError, GpuResult, ImageId, MemoryId, PlatformBufferId,
    SemaphoreId, WindowHandle,
};
use crate::util::fd::close_raw;

/// One recorded blit, with the exact parameters the real driver would hand
/// to `vkCmdBlitImage`.
#[derive(Debug, Clone)]
pub struct BlitRecord {
    pub frame: u64,
    pub slot: usize,
    pub src: ImageId,
    pub src_layout: vk::ImageLayout,
    pub src_offsets: [vk::Offset3D; 2],
    pub display_image: u32,
    pub dst_layout: vk::ImageLayout,
    pub dst_offsets: [vk::Offset3D; 2],
    pub filter: vk::Filter,
}

#[derive(Debug, Clone)]
pub struct SubmitRecord {
    pub frame: u64,
    pub slot: usize,
    pub display_image: u32,
    pub waits: Vec<SemaphoreId>,
}

#[derive(Debug, Default)]
struct MockState {
    next_id: u64,
    images: HashSet<u64>,
    memories: HashSet<u64>,
    semaphores: HashSet<u64>,
    platform_buffers: HashSet<u64>,
    display: Option<MockDisplay>,
    next_surface_extent: Option<Extent2d>,
    frame: u64,
    blits: Vec<BlitRecord>,
    transitions: usize,
    submits: Vec<SubmitRecord>,
    imported_sync_fds: Vec<(SemaphoreId, bool)>,
    sent_platform_buffers: Vec<PlatformBufferId>,
    platform_allocs_before_failure: Option<u32>,
}

#[derive(Debug)]
struct MockDisplay {
    extent: Extent2d,
    image_count: u32,
    next_image: u32,
}

/// A [`GpuDriver`] that records instead of rendering.
pub struct MockGpu {
    state: Mutex<MockState>,
    /// When set, `export_present_fence` returns descriptor 0, reproducing
    /// the driver quirk the display loop must normalize to `-1`.
    zero_fd_quirk: AtomicBool,
}

impl MockGpu {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            zero_fd_quirk: AtomicBool::new(false),
        }
    }

    fn alloc_id(state: &mut MockState) -> u64 {
        state.next_id += 1;
        state.next_id
    }

    /// Extent reported by the next `create_display_swapchain` call.
    pub fn set_next_surface_extent(&self, extent: Extent2d) {
        self.state.lock().unwrap().next_surface_extent = Some(extent);
    }

    pub fn set_zero_fd_quirk(&self, enabled: bool) {
        self.zero_fd_quirk.store(enabled, Ordering::SeqCst);
    }

    /// Makes `allocate_platform_buffer` fail after `n` more successes.
    pub fn fail_platform_alloc_after(&self, n: u32) {
        self.state.lock().unwrap().platform_allocs_before_failure = Some(n);
    }

    pub fn blits(&self) -> Vec<BlitRecord> {
        self.state.lock().unwrap().blits.clone()
    }

    pub fn submits(&self) -> Vec<SubmitRecord> {
        self.state.lock().unwrap().submits.clone()
    }

    pub fn transition_count(&self) -> usize {
        self.state.lock().unwrap().transitions
    }

    pub fn sent_platform_buffers(&self) -> Vec<PlatformBufferId> {
        self.state.lock().unwrap().sent_platform_buffers.clone()
    }

    pub fn imported_sync_fds(&self) -> Vec<(SemaphoreId, bool)> {
        self.state.lock().unwrap().imported_sync_fds.clone()
    }

    /// Live images + memories + semaphores + platform buffers, for leak
    /// assertions after teardown.
    pub fn live_object_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.images.len()
            + state.memories.len()
            + state.semaphores.len()
            + state.platform_buffers.len()
    }

    pub fn frame_count(&self) -> u64 {
        self.state.lock().unwrap().frame
    }
}

impl Default for MockGpu {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDriver for MockGpu {
    fn create_client_image(
        &self,
        format: i32,
        _extent: Extent2d,
        _usage: u32,
    ) -> GpuResult<ImageId> {
        if platform_buffer_format(format).is_none() {
            return Err(GpuError::UnsupportedFormat(format));
        }
        let mut state = self.state.lock().unwrap();
        let id = Self::alloc_id(&mut state);
        state.images.insert(id);
        Ok(ImageId(id))
    }

    fn allocate_platform_buffer(
        &self,
        format: i32,
        _extent: Extent2d,
    ) -> GpuResult<PlatformBufferId> {
        let mut state = self.state.lock().unwrap();
        if let Some(remaining) = state.platform_allocs_before_failure.as_mut() {
            if *remaining == 0 {
                return Err(GpuError::Driver("injected allocation failure".into()));
            }
            *remaining -= 1;
        }
        if platform_buffer_format(format).is_none() {
            return Err(GpuError::UnsupportedFormat(format));
        }
        let id = Self::alloc_id(&mut state);
        state.platform_buffers.insert(id);
        Ok(PlatformBufferId(id))
    }

    fn send_platform_buffer(&self, buffer: PlatformBufferId, socket: RawFd) -> GpuResult<()> {
        // One datagram per handle, standing in for the platform's dedicated
        // socket primitive; preserves the reply ordering contract.
        transport::send_message(socket, &buffer.0.to_ne_bytes(), &[])
            .map_err(GpuError::HandleTransfer)?;
        self.state.lock().unwrap().sent_platform_buffers.push(buffer);
        Ok(())
    }

    fn import_platform_buffer(
        &self,
        image: ImageId,
        buffer: PlatformBufferId,
    ) -> GpuResult<MemoryId> {
        let mut state = self.state.lock().unwrap();
        if !state.images.contains(&image.0) || !state.platform_buffers.contains(&buffer.0) {
            return Err(GpuError::Driver("import of unknown object".into()));
        }
        let id = Self::alloc_id(&mut state);
        state.memories.insert(id);
        Ok(MemoryId(id))
    }

    fn create_semaphore(&self) -> GpuResult<SemaphoreId> {
        let mut state = self.state.lock().unwrap();
        let id = Self::alloc_id(&mut state);
        state.semaphores.insert(id);
        Ok(SemaphoreId(id))
    }

    fn import_semaphore_sync_fd(&self, semaphore: SemaphoreId, fd: RawFd) -> GpuResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.semaphores.contains(&semaphore.0) {
            close_raw(fd);
            return Err(GpuError::Driver("import into unknown semaphore".into()));
        }
        state.imported_sync_fds.push((semaphore, fd >= 0));
        // The import consumes the descriptor.
        close_raw(fd);
        Ok(())
    }

    fn destroy_image(&self, image: ImageId) {
        self.state.lock().unwrap().images.remove(&image.0);
    }

    fn free_memory(&self, memory: MemoryId) {
        self.state.lock().unwrap().memories.remove(&memory.0);
    }

    fn release_platform_buffer(&self, buffer: PlatformBufferId) {
        self.state.lock().unwrap().platform_buffers.remove(&buffer.0);
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreId) {
        self.state.lock().unwrap().semaphores.remove(&semaphore.0);
    }

    fn create_display_swapchain(&self, _window: WindowHandle) -> GpuResult<Extent2d> {
        let mut state = self.state.lock().unwrap();
        let extent = state
            .next_surface_extent
            .unwrap_or(Extent2d::new(1280, 720));
        state.display = Some(MockDisplay {
            extent,
            image_count: 3,
            next_image: 0,
        });
        Ok(extent)
    }

    fn destroy_display_swapchain(&self) {
        self.state.lock().unwrap().display = None;
    }

    fn begin_frame(&self, _slot: usize) -> GpuResult<()> {
        // Stand-in for the composite-done fence wait; keeps free-running
        // test loops paced.
        std::thread::sleep(Duration::from_millis(1));
        Ok(())
    }

    fn acquire_display_image(&self, _slot: usize) -> GpuResult<u32> {
        let mut state = self.state.lock().unwrap();
        let display = state.display.as_mut().ok_or(GpuError::NoSwapchain)?;
        let index = display.next_image;
        display.next_image = (display.next_image + 1) % display.image_count;
        Ok(index)
    }

    fn record_display_layout_transition(&self, _slot: usize) {
        self.state.lock().unwrap().transitions += 1;
    }

    fn record_blit(
        &self,
        slot: usize,
        src: ImageId,
        src_extent: Extent2d,
        display_image: u32,
        dst_extent: Extent2d,
    ) {
        let mut state = self.state.lock().unwrap();
        let frame = state.frame;
        state.blits.push(BlitRecord {
            frame,
            slot,
            src,
            src_layout: vk::ImageLayout::GENERAL,
            src_offsets: [
                vk::Offset3D { x: 0, y: 0, z: 0 },
                vk::Offset3D {
                    x: src_extent.width as i32,
                    y: src_extent.height as i32,
                    z: 1,
                },
            ],
            display_image,
            dst_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            dst_offsets: [
                vk::Offset3D { x: 0, y: 0, z: 0 },
                vk::Offset3D {
                    x: dst_extent.width as i32,
                    y: dst_extent.height as i32,
                    z: 1,
                },
            ],
            filter: vk::Filter::NEAREST,
        });
    }

    fn submit_and_present(
        &self,
        slot: usize,
        display_image: u32,
        waits: &[SemaphoreId],
    ) -> GpuResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.display.is_none() {
            return Err(GpuError::NoSwapchain);
        }
        let frame = state.frame;
        state.submits.push(SubmitRecord {
            frame,
            slot,
            display_image,
            waits: waits.to_vec(),
        });
        state.frame += 1;
        Ok(())
    }

    fn export_present_fence(&self, _slot: usize) -> GpuResult<RawFd> {
        if self.zero_fd_quirk.load(Ordering::SeqCst) {
            return Ok(0);
        }
        let fd = std::fs::File::open("/dev/null")
            .map_err(|e| GpuError::Driver(e.to_string()))?
            .into_raw_fd();
        Ok(fd)
    }

    fn wait_idle(&self) {}
}
