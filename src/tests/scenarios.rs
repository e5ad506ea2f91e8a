//! End-to-end scenarios over real sockets with the mock GPU driver.
//!
//! Each test stands up a full server (listener, supervisor, workers,
//! compositor, display loop) on an isolated abstract socket name and drives
//! it through the client helpers, asserting on what the mock driver
//! recorded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ash::vk;

use crate::core::client::Client;
use crate::core::protocol::{status, Extent2d};
use crate::core::{Compositor, Server, ServerConfig};
use crate::gpu::mock::MockGpu;
use crate::gpu::{SemaphoreId, WindowHandle};
use crate::util::SyncFd;

static SOCKET_COUNTER: AtomicU64 = AtomicU64::new(0);

struct TestServer {
    mock: Arc<MockGpu>,
    compositor: Arc<Compositor>,
    socket_name: String,
    supervisor: Option<JoinHandle<()>>,
}

impl TestServer {
    fn start() -> Self {
        let socket_name = format!(
            "cassia-test-{}-{}",
            std::process::id(),
            SOCKET_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let mock = Arc::new(MockGpu::new());
        let compositor = Arc::new(Compositor::new(mock.clone()).unwrap());
        let config = ServerConfig {
            socket_name: socket_name.clone(),
            ..ServerConfig::default()
        };
        let mut server = Server::bind(&config, compositor.clone()).unwrap();
        let supervisor = std::thread::spawn(move || {
            server.run().unwrap();
        });
        Self {
            mock,
            compositor,
            socket_name,
            supervisor: Some(supervisor),
        }
    }

    fn connect(&self) -> Client {
        Client::connect(&self.socket_name).unwrap()
    }

    fn attach_surface(&self, extent: Extent2d) {
        self.mock.set_next_surface_extent(extent);
        self.compositor.set_surface(Some(WindowHandle(0x1))).unwrap();
    }

    fn stop(&mut self) {
        self.compositor.shutdown();
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.join().unwrap();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn allocate(client: &Client, image_count: u32, extent: Extent2d) -> u32 {
    let response = client
        .allocate_swapchain(
            0,
            vk::Format::R8G8B8A8_UNORM.as_raw(),
            extent,
            vk::ImageUsageFlags::TRANSFER_DST.as_raw(),
            vk::CompositeAlphaFlagsKHR::INHERIT.as_raw(),
            image_count,
            |client| {
                let blob = client.recv_handle_blob()?;
                assert_eq!(blob.len(), 8, "platform handle datagram");
                Ok(())
            },
        )
        .unwrap();
    assert_eq!(response.result, status::SUCCESS);
    response.handle
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn open_fd_count() -> usize {
    std::fs::read_dir("/proc/self/fd").unwrap().count()
}

/// E1: allocate + dequeue + queue + composite, literal values.
#[test]
fn test_allocate_dequeue_queue_composite() {
    let server = TestServer::start();
    let client = server.connect();

    let handle = allocate(&client, 3, Extent2d::new(640, 480));
    assert_eq!(handle, 1);

    let (response, fence) = client.dequeue(handle, u64::MAX).unwrap();
    assert_eq!(response.result, status::SUCCESS);
    assert_eq!(response.image_index, 0);
    assert!(fence.is_signaled(), "first dequeue carries no fence");

    client.queue(handle, 0, SyncFd::signaled()).unwrap();
    server.attach_surface(Extent2d::new(1280, 720));

    wait_until("first blit", || !server.mock.blits().is_empty());
    let blits = server.mock.blits();
    let blit = &blits[0];
    assert_eq!(blit.src_layout, vk::ImageLayout::GENERAL);
    assert_eq!(blit.dst_layout, vk::ImageLayout::PRESENT_SRC_KHR);
    assert_eq!(blit.filter, vk::Filter::NEAREST);
    assert_eq!(blit.src_offsets[0], vk::Offset3D { x: 0, y: 0, z: 0 });
    assert_eq!(
        blit.src_offsets[1],
        vk::Offset3D {
            x: 640,
            y: 480,
            z: 1
        }
    );
    assert_eq!(blit.dst_offsets[0], vk::Offset3D { x: 0, y: 0, z: 0 });
    assert_eq!(
        blit.dst_offsets[1],
        vk::Offset3D {
            x: 1280,
            y: 720,
            z: 1
        }
    );
}

/// E2: a fully-busy swapchain times out with an explicit -1 fd.
#[test]
fn test_dequeue_timeout_on_busy_swapchain() {
    let server = TestServer::start();
    let client = server.connect();
    let handle = allocate(&client, 2, Extent2d::new(64, 64));

    let (a, _) = client.dequeue(handle, u64::MAX).unwrap();
    let (b, _) = client.dequeue(handle, u64::MAX).unwrap();
    assert_eq!(a.result, status::SUCCESS);
    assert_eq!(b.result, status::SUCCESS);
    assert_ne!(a.image_index, b.image_index);

    let start = Instant::now();
    let timeout = Duration::from_millis(1);
    let (timed_out, fence) = client.dequeue(handle, timeout.as_nanos() as u64).unwrap();
    let elapsed = Instant::now() - start;
    assert_eq!(timed_out.result, status::TIMEOUT);
    assert!(fence.is_signaled());
    assert!(elapsed >= timeout);
    // Upper bound: the timeout must be honored within one composition
    // period plus the socket round trip; allow generous scheduler slack.
    assert!(
        elapsed < timeout + Duration::from_millis(100),
        "dequeue overshot its timeout: {elapsed:?}"
    );
}

/// E3: back-pressure; every queue is eventually consumed exactly once.
#[test]
fn test_back_pressure_consumes_every_queue() {
    let server = TestServer::start();
    let client = server.connect();
    let handle = allocate(&client, 2, Extent2d::new(320, 240));
    server.attach_surface(Extent2d::new(1280, 720));

    const ITERATIONS: usize = 120;
    for _ in 0..ITERATIONS {
        let (response, fence) = client.dequeue(handle, u64::MAX).unwrap();
        assert_eq!(response.result, status::SUCCESS);
        drop(fence);
        let queued = client
            .queue(handle, response.image_index, SyncFd::signaled())
            .unwrap();
        assert_eq!(queued.result, status::SUCCESS);
    }

    // Each queued frame contributes exactly one semaphore wait when it is
    // swept out of the pending ring.
    wait_until("all queued frames composed", || {
        server
            .mock
            .submits()
            .iter()
            .map(|submit| submit.waits.len())
            .sum::<usize>()
            == ITERATIONS
    });
}

/// Queue order within one swapchain is preserved across frames (FIFO).
#[test]
fn test_fifo_per_swapchain() {
    let server = TestServer::start();
    let client = server.connect();
    let handle = allocate(&client, 2, Extent2d::new(64, 64));

    let (first, _) = client.dequeue(handle, u64::MAX).unwrap();
    let (second, _) = client.dequeue(handle, u64::MAX).unwrap();
    // Queue both without intervening composition (no surface yet).
    client
        .queue(handle, first.image_index, SyncFd::signaled())
        .unwrap();
    client
        .queue(handle, second.image_index, SyncFd::signaled())
        .unwrap();

    let (sem_first, sem_second) = {
        let state = server.compositor.engine().lock_state();
        let swapchain = &state.swapchains[&handle];
        (
            swapchain.buffers[first.image_index as usize].queue_semaphore,
            swapchain.buffers[second.image_index as usize].queue_semaphore,
        )
    };

    server.attach_surface(Extent2d::new(800, 600));
    wait_until("both queued frames composed", || {
        server
            .mock
            .submits()
            .iter()
            .map(|submit| submit.waits.len())
            .sum::<usize>()
            == 2
    });

    let consumed: Vec<SemaphoreId> = server
        .mock
        .submits()
        .iter()
        .flat_map(|submit| submit.waits.clone())
        .collect();
    assert_eq!(consumed, vec![sem_first, sem_second]);

    // And the blit order follows: the first composited frame shows the
    // first queued buffer.
    let blits = server.mock.blits();
    let image_first = {
        let state = server.compositor.engine().lock_state();
        state.swapchains[&handle].buffers[first.image_index as usize].image
    };
    assert_eq!(blits[0].src, image_first);
}

/// E4: surface bounce; new extent, platform images transitioned exactly
/// once per epoch.
#[test]
fn test_surface_bounce() {
    let server = TestServer::start();
    let client = server.connect();
    let handle = allocate(&client, 2, Extent2d::new(100, 100));

    client.dequeue(handle, u64::MAX).unwrap();
    client.queue(handle, 0, SyncFd::signaled()).unwrap();

    server.attach_surface(Extent2d::new(1280, 720));
    wait_until("first epoch blit", || !server.mock.blits().is_empty());
    assert_eq!(server.mock.transition_count(), 1);

    server.compositor.set_surface(None).unwrap();
    std::thread::sleep(Duration::from_millis(30));
    let blits_while_paused = server.mock.blits().len();

    server.attach_surface(Extent2d::new(800, 600));
    wait_until("post-bounce blit at new extent", || {
        server
            .mock
            .blits()
            .iter()
            .skip(blits_while_paused)
            .any(|blit| {
                blit.dst_offsets[1]
                    == vk::Offset3D {
                        x: 800,
                        y: 600,
                        z: 1,
                    }
            })
    });
    assert_eq!(server.mock.transition_count(), 2);

    // A few more frames must not transition again within the epoch.
    let frames = server.mock.frame_count();
    wait_until("more frames", || server.mock.frame_count() > frames + 3);
    assert_eq!(server.mock.transition_count(), 2);
}

/// E5: disconnect with a dequeue in flight; the other connection is
/// unaffected and fds return to baseline.
#[test]
fn test_disconnect_mid_dequeue() {
    let mut server = TestServer::start();

    let client_b = server.connect();
    let handle_b = allocate(&client_b, 1, Extent2d::new(32, 32));

    wait_until("baseline settles", || server.mock.live_object_count() == 4);
    let baseline = open_fd_count();

    let client_a = Arc::new(server.connect());
    let handle_a = allocate(&client_a, 1, Extent2d::new(32, 32));

    // Occupy A's only buffer, then park a dequeue on it.
    let (response, _) = client_a.dequeue(handle_a, u64::MAX).unwrap();
    client_a
        .queue(handle_a, response.image_index, SyncFd::signaled())
        .unwrap();
    let waiter = {
        let client_a = client_a.clone();
        std::thread::spawn(move || client_a.dequeue(handle_a, u64::MAX))
    };
    std::thread::sleep(Duration::from_millis(50));

    // Sever A. The engine must tear down its swapchain and cancel the wait.
    nix::sys::socket::shutdown(client_a.as_raw_fd(), nix::sys::socket::Shutdown::Both).unwrap();
    assert!(waiter.join().unwrap().is_err());
    drop(client_a);

    wait_until("A's swapchain destroyed", || {
        server.compositor.engine().swapchain_count() == 1
    });

    // B still works.
    let (response, _) = client_b.dequeue(handle_b, u64::MAX).unwrap();
    assert_eq!(response.result, status::SUCCESS);

    wait_until("fd count back to baseline", || {
        open_fd_count() <= baseline
    });
    server.stop();
}

/// Property 7: a bounded workload leaves no fds behind.
#[test]
fn test_fd_leak_freedom() {
    let mut server = TestServer::start();
    server.attach_surface(Extent2d::new(1280, 720));
    wait_until("display running", || server.mock.frame_count() > 0);

    let baseline = open_fd_count();

    for _ in 0..4 {
        let client = server.connect();
        let handle = allocate(&client, 2, Extent2d::new(64, 64));
        for _ in 0..16 {
            let (response, fence) = client.dequeue(handle, u64::MAX).unwrap();
            assert_eq!(response.result, status::SUCCESS);
            drop(fence);
            client
                .queue(handle, response.image_index, SyncFd::signaled())
                .unwrap();
        }
        drop(client);
        wait_until("connection reaped", || {
            server.compositor.engine().swapchain_count() == 0
        });
    }

    wait_until("fd count back to baseline", || {
        open_fd_count() <= baseline
    });
    assert_eq!(server.mock.live_object_count(), 0);
    server.stop();
}

/// E6 + property 6: acquire fences ferried through composition, with the
/// zero-fd driver quirk normalized to -1.
#[test]
fn test_fence_transfer_and_zero_fd_quirk() {
    let server = TestServer::start();
    let client = server.connect();
    let handle = allocate(&client, 2, Extent2d::new(64, 64));
    server.attach_surface(Extent2d::new(1280, 720));

    // Composite buffer 0 once.
    let (response, _) = client.dequeue(handle, u64::MAX).unwrap();
    assert_eq!(response.image_index, 0);
    client.queue(handle, 0, SyncFd::signaled()).unwrap();
    wait_until("buffer 0 composed", || {
        server.mock.submits().iter().any(|s| !s.waits.is_empty())
    });
    // Let the fence ferry finish (it happens in the same critical section
    // as the submit, so one more frame is plenty).
    let frames = server.mock.frame_count();
    wait_until("another frame", || server.mock.frame_count() > frames);

    // Buffer 1 was never composed: pre-signaled. Buffer 0 carries a real
    // fence produced by composition.
    let (response, fence_1) = client.dequeue(handle, u64::MAX).unwrap();
    assert_eq!(response.image_index, 1);
    assert!(fence_1.is_signaled());
    let (response, fence_0) = client.dequeue(handle, u64::MAX).unwrap();
    assert_eq!(response.image_index, 0);
    assert!(!fence_0.is_signaled(), "composited buffer must carry a fence");

    // Now inject the quirk: the driver hands out descriptor 0, which must
    // reach the client normalized to -1.
    server.mock.set_zero_fd_quirk(true);
    client.queue(handle, 0, SyncFd::signaled()).unwrap();
    let waits = server
        .mock
        .submits()
        .iter()
        .map(|s| s.waits.len())
        .sum::<usize>();
    wait_until("quirk frame composed", || {
        server
            .mock
            .submits()
            .iter()
            .map(|s| s.waits.len())
            .sum::<usize>()
            > waits
    });
    let frames = server.mock.frame_count();
    wait_until("another frame", || server.mock.frame_count() > frames);

    // The quirk stays active so every re-ferry keeps the sentinel until the
    // dequeue observes it.
    let (response, fence) = client.dequeue(handle, u64::MAX).unwrap();
    assert_eq!(response.image_index, 0);
    assert!(
        fence.is_signaled(),
        "zero-fd quirk must surface as the signaled sentinel"
    );
}

/// Property 1: handles stay strictly increasing across reconnects.
#[test]
fn test_handle_uniqueness_across_reconnects() {
    let server = TestServer::start();

    let first = {
        let client = server.connect();
        allocate(&client, 2, Extent2d::new(16, 16))
    };
    let second = {
        let client = server.connect();
        allocate(&client, 2, Extent2d::new(16, 16))
    };
    assert!(first > 0);
    assert!(second > first);
}

/// Property 3: pressure on N-1 buffers; composing one frame frees the
/// remaining buffer within bounded time.
#[test]
fn test_dequeue_fairness_under_pressure() {
    let server = TestServer::start();
    let client = server.connect();
    let handle = allocate(&client, 3, Extent2d::new(64, 64));

    let (held_a, _) = client.dequeue(handle, u64::MAX).unwrap();
    let (held_b, _) = client.dequeue(handle, u64::MAX).unwrap();
    let (third, _) = client.dequeue(handle, u64::MAX).unwrap();
    client
        .queue(handle, third.image_index, SyncFd::signaled())
        .unwrap();

    server.attach_surface(Extent2d::new(1280, 720));

    let (response, _) = client
        .dequeue(handle, Duration::from_secs(2).as_nanos() as u64)
        .unwrap();
    assert_eq!(response.result, status::SUCCESS);
    assert_eq!(response.image_index, third.image_index);
    assert_ne!(response.image_index, held_a.image_index);
    assert_ne!(response.image_index, held_b.image_index);
}
