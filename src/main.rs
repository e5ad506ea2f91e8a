use std::sync::Arc;

use anyhow::{Context, Result};

use cassiad::core::{Compositor, Server, ServerConfig};
use cassiad::gpu::vulkan::VulkanDriver;

fn main() -> Result<()> {
    // Initialize logging
    // Set default log level to info
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info,cassiad=debug");
    }
    tracing_subscriber::fmt()
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::new(
            "%Y-%m-%d %H:%M:%S".to_string(),
        ))
        .with_ansi(false)
        .init();

    let config = ServerConfig {
        enable_validation: std::env::var("CASSIAD_VALIDATION").is_ok(),
        ..ServerConfig::default()
    };

    let driver = Arc::new(
        VulkanDriver::new(config.enable_validation).context("failed to create Vulkan context")?,
    );
    let compositor = Arc::new(Compositor::new(driver)?);

    // The host application delivers the output surface through
    // Compositor::set_surface; until then composition idles and clients can
    // already connect and allocate.
    let mut server = Server::bind(&config, compositor)?;
    server.run()
}
