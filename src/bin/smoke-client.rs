//! Protocol smoke test client.
//!
//! Connects to a running cassiad, allocates a small virtual swapchain, and
//! drives a few dequeue/queue cycles with pre-signaled fences. Run with:
//! `CASSIA_SOCK=cassia cargo run --bin smoke-client`

use anyhow::{bail, Context, Result};
use ash::vk;

use cassiad::core::client::Client;
use cassiad::core::protocol::{status, Extent2d};
use cassiad::util::SyncFd;

fn main() -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt().with_ansi(false).init();

    let client = Client::connect_env().context("failed to connect to cassiad")?;

    let response = client.allocate_swapchain(
        0,
        vk::Format::R8G8B8A8_UNORM.as_raw(),
        Extent2d::new(640, 480),
        vk::ImageUsageFlags::TRANSFER_DST.as_raw(),
        vk::CompositeAlphaFlagsKHR::INHERIT.as_raw(),
        3,
        |client| {
            let blob = client.recv_handle_blob()?;
            tracing::info!("received platform handle ({} bytes)", blob.len());
            Ok(())
        },
    )?;
    if response.result != status::SUCCESS {
        bail!("allocate_swapchain failed: {}", response.result);
    }
    tracing::info!("allocated swapchain handle {}", response.handle);

    for iteration in 0..30 {
        let (dequeued, fence) = client.dequeue(response.handle, u64::MAX)?;
        if dequeued.result != status::SUCCESS {
            bail!("dequeue failed: {}", dequeued.result);
        }
        // A real client would render here and pass its render-complete
        // fence; we hand the buffer straight back.
        drop(fence);
        let queued = client.queue(response.handle, dequeued.image_index, SyncFd::signaled())?;
        if queued.result != status::SUCCESS {
            bail!("queue failed: {}", queued.result);
        }
        tracing::info!("iteration {iteration}: queued image {}", dequeued.image_index);
    }

    tracing::info!("smoke test complete");
    Ok(())
}
