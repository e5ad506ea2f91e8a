pub mod client;
pub mod compositor;
pub mod display;
pub mod engine;
pub mod errors;
pub mod protocol;
pub mod server;
pub mod transport;

// Re-export key types
pub use compositor::{Compositor, SurfaceState};
pub use engine::{BufferState, ConnectionId, Engine};
pub use server::{Server, ServerConfig};
