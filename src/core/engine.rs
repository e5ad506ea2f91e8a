//! Virtual swapchain engine.
//!
//! Every client window gets a virtual swapchain: a small ring of GPU images
//! backed by shared platform buffers. Clients dequeue a free buffer, render
//! into it out of process, and queue it back with a sync fd; the display
//! loop sweeps the queued ring each frame. All engine state lives under one
//! mutex with one condition variable that the display thread signals every
//! composition cycle.

use std::collections::{BTreeMap, VecDeque};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::core::protocol::{status, AllocateSwapchain, Extent2d, SwapchainHandle};
use crate::gpu::{
    platform_buffer_format, GpuDriver, GpuError, GpuResult, ImageId, MemoryId, PlatformBufferId,
    SemaphoreId, MAX_SWAPCHAIN_IMAGES,
};
use crate::util::fd::{close_raw, SyncFd};

/// Identifies the client connection that owns a virtual swapchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Buffer ownership states. The only legal cycle is
/// `Free -> Dequeued -> Queued -> Free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Owned by the engine; a client may dequeue it.
    Free,
    /// Handed to a client for rendering.
    Dequeued,
    /// Submitted by the client, waiting for composition.
    Queued,
}

/// One image of a virtual swapchain and its bookkeeping.
pub struct BufferSlot {
    pub image: ImageId,
    pub memory: MemoryId,
    pub platform: PlatformBufferId,
    /// Signaled (via temporary sync-fd import) when the client's rendering
    /// into this buffer is finished.
    pub queue_semaphore: SemaphoreId,
    pub state: BufferState,
    /// Signals when the GPU is done reading the buffer; handed to the
    /// client on the next dequeue.
    pub acquire_fence: SyncFd,
}

pub struct VirtualSwapchain {
    pub owner: ConnectionId,
    pub extent: Extent2d,
    pub buffers: Vec<BufferSlot>,
    /// Buffer indices queued for composition, in `queue` call order.
    pub pending: VecDeque<u32>,
    /// Shown in the previous composited frame; the fallback when `pending`
    /// is empty (the last frame stays on screen).
    pub last_presented: u32,
    /// Rotating dequeue cursor; makes `last_presented` the
    /// least-recently-visited candidate.
    cursor: usize,
    /// Two ~1s buckets for the frame-rate report.
    pub frame_count: [u32; 2],
    last_rate_report: Instant,
}

impl VirtualSwapchain {
    /// Selector: advance the cursor first, fall back to a linear scan.
    fn select_free(&mut self) -> Option<usize> {
        self.cursor = (self.cursor + 1) % self.buffers.len();
        if self.buffers[self.cursor].state == BufferState::Free {
            return Some(self.cursor);
        }
        self.buffers
            .iter()
            .position(|buffer| buffer.state == BufferState::Free)
    }

    /// Called by the display loop for each frame that consumed a queued
    /// buffer from this swapchain.
    pub fn note_composited_frame(&mut self, handle: SwapchainHandle, now: Instant) {
        self.frame_count[0] += 1;
        if now.duration_since(self.last_rate_report) >= Duration::from_secs(1) {
            tracing::info!(
                "swapchain {handle}: frame rate: {}",
                (self.frame_count[0] + self.frame_count[1]) / 2
            );
            self.frame_count[1] = self.frame_count[0];
            self.frame_count[0] = 0;
            self.last_rate_report = now;
        }
    }
}

pub struct EngineState {
    pub swapchains: BTreeMap<SwapchainHandle, VirtualSwapchain>,
    next_handle: SwapchainHandle,
    stopping: bool,
}

impl EngineState {
    /// True when `handle` was never assigned (as opposed to destroyed).
    fn never_assigned(&self, handle: SwapchainHandle) -> bool {
        handle == 0 || handle >= self.next_handle
    }
}

/// Partially constructed buffer, released explicitly on failure. No
/// finalizers: every resource is handed back to the driver by name.
#[derive(Default)]
struct PartialBuffer {
    image: Option<ImageId>,
    platform: Option<PlatformBufferId>,
    memory: Option<MemoryId>,
}

pub struct Engine {
    driver: Arc<dyn GpuDriver>,
    state: Mutex<EngineState>,
    cv: Condvar,
}

fn status_from_gpu(error: &GpuError) -> i32 {
    match error {
        GpuError::UnsupportedFormat(_) => status::ERROR_FORMAT_NOT_SUPPORTED,
        _ => status::ERROR_OUT_OF_DEVICE_MEMORY,
    }
}

impl Engine {
    pub fn new(driver: Arc<dyn GpuDriver>) -> Self {
        Self {
            driver,
            state: Mutex::new(EngineState {
                swapchains: BTreeMap::new(),
                next_handle: 1,
                stopping: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Locks the engine state for the display loop's per-frame critical
    /// section.
    pub fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap()
    }

    /// Wakes every dequeue waiter; issued by the display loop at the head
    /// of each composition cycle.
    pub fn notify_waiters(&self) {
        self.cv.notify_all();
    }

    /// Marks the engine as stopping and cancels all waiters.
    pub fn begin_shutdown(&self) {
        self.state.lock().unwrap().stopping = true;
        self.cv.notify_all();
    }

    /// Creates a virtual swapchain for `cmd`, transmitting one platform
    /// buffer handle per image over `sock` before the caller sends the
    /// response record. Returns a status code and the new handle.
    pub fn allocate(
        &self,
        owner: ConnectionId,
        cmd: &AllocateSwapchain,
        sock: RawFd,
    ) -> (i32, SwapchainHandle) {
        let count = cmd.image_count as usize;
        if count == 0 || count > MAX_SWAPCHAIN_IMAGES {
            return (status::ERROR_INITIALIZATION_FAILED, 0);
        }
        if cmd.extent.width == 0 || cmd.extent.height == 0 {
            return (status::ERROR_INITIALIZATION_FAILED, 0);
        }
        if platform_buffer_format(cmd.format).is_none() {
            return (status::ERROR_FORMAT_NOT_SUPPORTED, 0);
        }

        let mut state = self.state.lock().unwrap();
        let handle = state.next_handle;
        state.next_handle += 1;

        tracing::info!(
            "allocate_swapchain: handle {handle} images {count} extent {}x{}",
            cmd.extent.width,
            cmd.extent.height
        );

        let mut buffers = Vec::with_capacity(count);
        for _ in 0..count {
            match self.allocate_buffer(cmd, sock) {
                Ok(slot) => buffers.push(slot),
                Err(e) => {
                    tracing::warn!("allocate_swapchain: handle {handle} failed: {e}");
                    for slot in buffers {
                        self.release_buffer(slot);
                    }
                    return (status_from_gpu(&e), 0);
                }
            }
        }

        // The cursor advances before it is read, so start it on the last
        // slot: a fresh swapchain hands out index 0 first.
        let cursor = buffers.len() - 1;
        state.swapchains.insert(
            handle,
            VirtualSwapchain {
                owner,
                extent: cmd.extent,
                buffers,
                pending: VecDeque::new(),
                last_presented: 0,
                cursor,
                frame_count: [0; 2],
                last_rate_report: Instant::now(),
            },
        );
        (status::SUCCESS, handle)
    }

    fn allocate_buffer(&self, cmd: &AllocateSwapchain, sock: RawFd) -> GpuResult<BufferSlot> {
        let mut partial = PartialBuffer::default();
        match self.try_allocate_buffer(cmd, sock, &mut partial) {
            Ok(slot) => Ok(slot),
            Err(e) => {
                if let Some(image) = partial.image {
                    self.driver.destroy_image(image);
                }
                if let Some(memory) = partial.memory {
                    self.driver.free_memory(memory);
                }
                if let Some(platform) = partial.platform {
                    self.driver.release_platform_buffer(platform);
                }
                Err(e)
            }
        }
    }

    fn try_allocate_buffer(
        &self,
        cmd: &AllocateSwapchain,
        sock: RawFd,
        partial: &mut PartialBuffer,
    ) -> GpuResult<BufferSlot> {
        let image = self
            .driver
            .create_client_image(cmd.format, cmd.extent, cmd.usage)?;
        partial.image = Some(image);
        let platform = self.driver.allocate_platform_buffer(cmd.format, cmd.extent)?;
        partial.platform = Some(platform);
        // The handle crosses the socket before the memory import so the
        // client can start importing while we finish; a client that later
        // reads an error response drops the handles it received.
        self.driver.send_platform_buffer(platform, sock)?;
        let memory = self.driver.import_platform_buffer(image, platform)?;
        partial.memory = Some(memory);
        let queue_semaphore = self.driver.create_semaphore()?;
        *partial = PartialBuffer::default();
        Ok(BufferSlot {
            image,
            memory,
            platform,
            queue_semaphore,
            state: BufferState::Free,
            acquire_fence: SyncFd::signaled(),
        })
    }

    /// Blocks until a buffer is free (or `timeout_ns` elapses) and hands it
    /// out together with its acquire fence. A timeout of `i64::MAX` or more
    /// waits indefinitely.
    pub fn dequeue(&self, handle: SwapchainHandle, timeout_ns: u64) -> (i32, u32, SyncFd) {
        let deadline = if timeout_ns >= i64::MAX as u64 {
            None
        } else {
            Some(Instant::now() + Duration::from_nanos(timeout_ns))
        };

        let mut state = self.state.lock().unwrap();
        loop {
            if state.stopping {
                return (status::ERROR_DEVICE_LOST, 0, SyncFd::signaled());
            }
            match state.swapchains.get_mut(&handle) {
                None => {
                    // A handle that once existed was torn down under the
                    // waiter; report the cancellation distinctly from a
                    // handle that never existed.
                    let code = if state.never_assigned(handle) {
                        status::ERROR_UNKNOWN
                    } else {
                        status::ERROR_SURFACE_LOST
                    };
                    return (code, 0, SyncFd::signaled());
                }
                Some(swapchain) => {
                    if let Some(index) = swapchain.select_free() {
                        let slot = &mut swapchain.buffers[index];
                        slot.state = BufferState::Dequeued;
                        let fence = SyncFd::from_raw(slot.acquire_fence.take());
                        return (status::SUCCESS, index as u32, fence);
                    }
                }
            }
            state = match deadline {
                None => self.cv.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return (status::TIMEOUT, 0, SyncFd::signaled());
                    }
                    self.cv.wait_timeout(state, deadline - now).unwrap().0
                }
            };
        }
    }

    /// Accepts a rendered buffer for composition. `fd` is the client's
    /// render-finished sync fd (`-1` for already signaled); ownership moves
    /// to this call.
    pub fn queue(&self, handle: SwapchainHandle, image_index: u32, fd: RawFd) -> i32 {
        let mut state = self.state.lock().unwrap();
        let Some(swapchain) = state.swapchains.get_mut(&handle) else {
            close_raw(fd);
            return status::ERROR_UNKNOWN;
        };
        let Some(slot) = swapchain.buffers.get_mut(image_index as usize) else {
            close_raw(fd);
            return status::ERROR_UNKNOWN;
        };
        if slot.state != BufferState::Dequeued {
            close_raw(fd);
            return status::ERROR_UNKNOWN;
        }

        // The import consumes the fd; the imported payload persists until
        // the display loop's submission waits on the semaphore.
        if let Err(e) = self.driver.import_semaphore_sync_fd(slot.queue_semaphore, fd) {
            tracing::warn!("queue: sync fd import failed for swapchain {handle}: {e}");
            return status_from_gpu(&e);
        }
        slot.state = BufferState::Queued;
        swapchain.pending.push_back(image_index);
        drop(state);
        self.cv.notify_all();
        status::SUCCESS
    }

    /// Tears down every swapchain owned by `conn`, releasing GPU objects,
    /// platform buffers, and held fds, and cancelling in-flight dequeues.
    pub fn destroy_connection(&self, conn: ConnectionId) {
        let mut state = self.state.lock().unwrap();
        let handles: Vec<SwapchainHandle> = state
            .swapchains
            .iter()
            .filter(|(_, swapchain)| swapchain.owner == conn)
            .map(|(&handle, _)| handle)
            .collect();
        for handle in handles {
            if let Some(swapchain) = state.swapchains.remove(&handle) {
                tracing::info!("destroying virtual swapchain {handle}");
                for slot in swapchain.buffers {
                    self.release_buffer(slot);
                }
            }
        }
        drop(state);
        self.cv.notify_all();
    }

    fn release_buffer(&self, slot: BufferSlot) {
        // The image holds the memory binding, the memory holds the platform
        // buffer import: release in that order.
        self.driver.destroy_image(slot.image);
        self.driver.free_memory(slot.memory);
        self.driver.release_platform_buffer(slot.platform);
        self.driver.destroy_semaphore(slot.queue_semaphore);
        // acquire_fence closes on drop
    }

    pub fn swapchain_count(&self) -> usize {
        self.state.lock().unwrap().swapchains.len()
    }
}
