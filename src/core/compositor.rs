//! Central compositor object.
//!
//! Owns the GPU driver, the virtual swapchain engine, and the display loop
//! thread, and dispatches decoded command records from per-connection
//! handlers. The platform's surface provider reaches in through
//! [`Compositor::set_surface`]; everything else arrives over the socket.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use anyhow::{Context, Result};

use crate::core::display;
use crate::core::engine::{ConnectionId, Engine};
use crate::core::errors::{CoreError, ProtocolError};
use crate::core::protocol::{
    self, CommandClass, CommandHeader, CommandInfo, CompositorCommand, CompositorCommandHeader,
    Extent2d, MAX_FDS_PER_MESSAGE, MAX_RESPONSE_SIZE,
};
use crate::core::transport::RecvFds;
use crate::gpu::{GpuDriver, WindowHandle};

/// Platform surface state, guarded by the surface mutex. The driver holds
/// the actual swapchain objects; this tracks whether one exists, its extent,
/// and whether the next frame must layout-transition the platform images.
pub struct SurfaceState {
    pub alive: bool,
    pub extent: Extent2d,
    pub needs_layout_transition: bool,
}

/// State shared between dispatch, the display loop, and surface callbacks.
pub(crate) struct Shared {
    pub(crate) driver: Arc<dyn GpuDriver>,
    pub(crate) engine: Engine,
    pub(crate) surface: Mutex<SurfaceState>,
    pub(crate) surface_cv: Condvar,
    pub(crate) stop: AtomicBool,
}

/// The main compositor object.
pub struct Compositor {
    shared: Arc<Shared>,
    display_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Compositor {
    /// Creates the compositor and starts its display thread. The thread
    /// idles until a surface is provided.
    pub fn new(driver: Arc<dyn GpuDriver>) -> Result<Self> {
        let shared = Arc::new(Shared {
            engine: Engine::new(driver.clone()),
            driver,
            surface: Mutex::new(SurfaceState {
                alive: false,
                extent: Extent2d::default(),
                needs_layout_transition: false,
            }),
            surface_cv: Condvar::new(),
            stop: AtomicBool::new(false),
        });

        let display_thread = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("cassiad-display".into())
                .spawn(move || display::run_display_loop(&shared))
                .context("failed to spawn display thread")?
        };

        tracing::info!("compositor started");
        Ok(Self {
            shared,
            display_thread: Mutex::new(Some(display_thread)),
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.shared.engine
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stop.load(Ordering::SeqCst)
    }

    /// Surface provider entry point, callable from any thread.
    ///
    /// `Some(window)` (re)creates the platform swapchain and resumes
    /// composition at the new extent; `None` pauses composition at the next
    /// iteration.
    pub fn set_surface(&self, window: Option<WindowHandle>) -> std::result::Result<(), CoreError> {
        let shared = &self.shared;
        let mut surface = shared.surface.lock().unwrap();
        match window {
            Some(window) => {
                let extent = shared.driver.create_display_swapchain(window)?;
                surface.alive = true;
                surface.extent = extent;
                surface.needs_layout_transition = true;
                tracing::info!(
                    "surface attached: {}x{}",
                    extent.width,
                    extent.height
                );
            }
            None => {
                shared.driver.wait_idle();
                shared.driver.destroy_display_swapchain();
                surface.alive = false;
                tracing::info!("surface detached; composition paused");
            }
        }
        drop(surface);
        shared.surface_cv.notify_one();
        Ok(())
    }

    /// Decodes and executes one command datagram.
    ///
    /// The response record and its fds are written into the caller's scratch
    /// buffers; the returned [`CommandInfo`] declares how much of each was
    /// filled. A decode failure is fatal to the connection.
    pub fn dispatch(
        &self,
        conn: ConnectionId,
        sock: RawFd,
        data: &[u8],
        fds: &mut RecvFds,
        response: &mut [u8; MAX_RESPONSE_SIZE],
        response_fds: &mut [RawFd; MAX_FDS_PER_MESSAGE],
    ) -> std::result::Result<CommandInfo, CoreError> {
        if data.len() > protocol::MAX_COMMAND_SIZE {
            return Err(ProtocolError::Oversized(data.len()).into());
        }
        let header: CommandHeader = protocol::read_record(data)?;
        let class = CommandClass::from_raw(header.class)
            .ok_or(ProtocolError::UnknownClass(header.class))?;
        match class {
            CommandClass::Compositor => {
                self.dispatch_compositor(conn, sock, data, fds, response, response_fds)
            }
        }
    }

    fn dispatch_compositor(
        &self,
        conn: ConnectionId,
        sock: RawFd,
        data: &[u8],
        fds: &mut RecvFds,
        response: &mut [u8; MAX_RESPONSE_SIZE],
        response_fds: &mut [RawFd; MAX_FDS_PER_MESSAGE],
    ) -> std::result::Result<CommandInfo, CoreError> {
        let header: CompositorCommandHeader = protocol::read_record(data)?;
        let ty = CompositorCommand::from_raw(header.ty)
            .ok_or(ProtocolError::UnknownType(header.ty))?;

        match ty {
            CompositorCommand::AllocateSwapchain => {
                let cmd: protocol::AllocateSwapchain = protocol::read_record(data)?;
                let (result, handle) = self.shared.engine.allocate(conn, &cmd, sock);
                let num_bytes = protocol::write_record(
                    &protocol::AllocateSwapchainResponse { result, handle },
                    response,
                );
                Ok(CommandInfo {
                    num_bytes,
                    num_fds: 0,
                })
            }
            CompositorCommand::Dequeue => {
                let cmd: protocol::Dequeue = protocol::read_record(data)?;
                let (result, image_index, mut fence) =
                    self.shared.engine.dequeue(cmd.handle, cmd.timeout_ns);
                let num_bytes = protocol::write_record(
                    &protocol::DequeueResponse {
                        result,
                        image_index,
                    },
                    response,
                );
                response_fds[0] = fence.take();
                Ok(CommandInfo {
                    num_bytes,
                    num_fds: 1,
                })
            }
            CompositorCommand::Queue => {
                let cmd: protocol::Queue = protocol::read_record(data)?;
                let fd = fds.take(0);
                let result = self.shared.engine.queue(cmd.handle, cmd.image_index, fd);
                let num_bytes =
                    protocol::write_record(&protocol::QueueResponse { result }, response);
                Ok(CommandInfo {
                    num_bytes,
                    num_fds: 0,
                })
            }
        }
    }

    /// Stops the display loop and joins it. Idempotent; also runs on drop.
    /// Connection teardown (and with it swapchain destruction) is the
    /// server's job and happens before this in an orderly shutdown.
    pub fn shutdown(&self) {
        if self.shared.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.engine.begin_shutdown();
        self.shared.surface_cv.notify_all();
        if let Some(thread) = self.display_thread.lock().unwrap().take() {
            if thread.join().is_err() {
                tracing::error!("display thread panicked");
            }
        }
        tracing::info!("compositor stopped");
    }
}

impl Drop for Compositor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::status;
    use crate::core::transport::{self, RecvOutcome};
    use crate::gpu::mock::MockGpu;
    use ash::vk;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use std::os::unix::io::{AsRawFd, OwnedFd};

    fn pair() -> (OwnedFd, OwnedFd) {
        socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .unwrap()
    }

    fn compositor() -> (Compositor, Arc<MockGpu>) {
        let mock = Arc::new(MockGpu::new());
        (Compositor::new(mock.clone()).unwrap(), mock)
    }

    fn dispatch_record<T: bytemuck::Pod>(
        compositor: &Compositor,
        sock: RawFd,
        record: &T,
    ) -> (CommandInfo, [u8; MAX_RESPONSE_SIZE], [RawFd; MAX_FDS_PER_MESSAGE]) {
        let mut data = [0u8; protocol::MAX_COMMAND_SIZE];
        let len = protocol::write_record(record, &mut data);
        let mut fds = empty_fds();
        let mut response = [0u8; MAX_RESPONSE_SIZE];
        let mut response_fds = [-1; MAX_FDS_PER_MESSAGE];
        let info = compositor
            .dispatch(
                ConnectionId(1),
                sock,
                &data[..len],
                &mut fds,
                &mut response,
                &mut response_fds,
            )
            .unwrap();
        (info, response, response_fds)
    }

    fn empty_fds() -> RecvFds {
        // Round-trip an fd-less datagram to get an owned empty fd set.
        let (a, b) = pair();
        transport::send_message(a.as_raw_fd(), b"x", &[]).unwrap();
        match transport::recv_message(b.as_raw_fd()).unwrap() {
            RecvOutcome::Message(msg) => msg.fds,
            _ => unreachable!(),
        }
    }

    fn alloc_record(image_count: u32) -> protocol::AllocateSwapchain {
        protocol::AllocateSwapchain {
            header: protocol::compositor_header(CompositorCommand::AllocateSwapchain),
            window_handle: 0,
            format: vk::Format::R8G8B8A8_UNORM.as_raw(),
            extent: Extent2d::new(640, 480),
            usage: vk::ImageUsageFlags::TRANSFER_DST.as_raw(),
            composite: vk::CompositeAlphaFlagsKHR::INHERIT.as_raw(),
            image_count,
        }
    }

    #[test]
    fn test_dispatch_allocate_then_dequeue() {
        let (compositor, _mock) = compositor();
        let (server, client) = pair();

        let (info, response, _) =
            dispatch_record(&compositor, server.as_raw_fd(), &alloc_record(3));
        assert_eq!(info.num_fds, 0);
        let resp: protocol::AllocateSwapchainResponse =
            protocol::read_record(&response[..info.num_bytes]).unwrap();
        assert_eq!(resp.result, status::SUCCESS);
        assert_eq!(resp.handle, 1);

        // The three platform handles went over the socket before the
        // response record would have.
        for _ in 0..3 {
            match transport::recv_message(client.as_raw_fd()).unwrap() {
                RecvOutcome::Message(msg) => assert_eq!(msg.data().len(), 8),
                _ => panic!("expected a handle datagram"),
            }
        }

        let dequeue = protocol::Dequeue {
            header: protocol::compositor_header(CompositorCommand::Dequeue),
            handle: 1,
            _pad: 0,
            timeout_ns: u64::MAX,
        };
        let (info, response, response_fds) =
            dispatch_record(&compositor, server.as_raw_fd(), &dequeue);
        assert_eq!(info.num_fds, 1);
        assert_eq!(response_fds[0], -1, "first dequeue is pre-signaled");
        let resp: protocol::DequeueResponse =
            protocol::read_record(&response[..info.num_bytes]).unwrap();
        assert_eq!(resp.result, status::SUCCESS);
    }

    #[test]
    fn test_dispatch_unknown_class_is_fatal() {
        let (compositor, _mock) = compositor();
        let (server, _client) = pair();
        let header = CommandHeader { class: 9 };
        let mut data = [0u8; protocol::MAX_COMMAND_SIZE];
        let len = protocol::write_record(&header, &mut data);
        let mut fds = empty_fds();
        let mut response = [0u8; MAX_RESPONSE_SIZE];
        let mut response_fds = [-1; MAX_FDS_PER_MESSAGE];
        let err = compositor
            .dispatch(
                ConnectionId(1),
                server.as_raw_fd(),
                &data[..len],
                &mut fds,
                &mut response,
                &mut response_fds,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Protocol(ProtocolError::UnknownClass(9))
        ));
    }

    #[test]
    fn test_dispatch_truncated_command_is_fatal() {
        let (compositor, _mock) = compositor();
        let (server, _client) = pair();
        let mut fds = empty_fds();
        let mut response = [0u8; MAX_RESPONSE_SIZE];
        let mut response_fds = [-1; MAX_FDS_PER_MESSAGE];
        let err = compositor
            .dispatch(
                ConnectionId(1),
                server.as_raw_fd(),
                &[0u8; 2],
                &mut fds,
                &mut response,
                &mut response_fds,
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::Protocol(_)));
    }

    #[test]
    fn test_set_surface_resumes_and_pauses() {
        let (compositor, mock) = compositor();
        mock.set_next_surface_extent(Extent2d::new(1280, 720));
        compositor.set_surface(Some(WindowHandle(0x1))).unwrap();

        // Composition runs: wait for at least one submitted frame.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while mock.frame_count() == 0 {
            assert!(std::time::Instant::now() < deadline, "no frames composed");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        compositor.set_surface(None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let paused_at = mock.frame_count();
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(
            mock.frame_count() <= paused_at + 1,
            "composition kept running after surface loss"
        );
        compositor.shutdown();
    }
}
