//! Wire protocol for the compositor socket.
//!
//! Commands and responses are fixed-size `repr(C)` records exchanged as
//! single datagrams on a SOCK_SEQPACKET connection; anything variable-length
//! travels out of band as file descriptors or platform buffer handles. The
//! records share the host ABI with the client side of the socket, so fields
//! are plain machine integers in host byte order.

use bytemuck::{Pod, Zeroable};

use crate::core::errors::ProtocolError;

/// Abstract-namespace socket name (a leading NUL byte is prepended by the
/// address encoding).
pub const SOCKET_NAME: &str = "cassia";

/// Environment variable through which the listen name is exported to clients.
pub const SOCKET_ENV: &str = "CASSIA_SOCK";

pub const MAX_COMMAND_SIZE: usize = 0x200;
pub const MAX_RESPONSE_SIZE: usize = 0x100;
pub const MAX_FDS_PER_MESSAGE: usize = 16;

/// Server-assigned virtual swapchain handle. Monotonically increasing from
/// 1 and never reused for the lifetime of the server; 0 is never valid.
pub type SwapchainHandle = u32;

/// Status codes carried in the `result` field of every response. These are
/// the graphics API's own `VkResult` values so the client library can hand
/// them straight back to its caller.
pub mod status {
    pub const SUCCESS: i32 = 0;
    pub const TIMEOUT: i32 = 2;
    pub const ERROR_OUT_OF_DEVICE_MEMORY: i32 = -2;
    pub const ERROR_INITIALIZATION_FAILED: i32 = -3;
    pub const ERROR_DEVICE_LOST: i32 = -4;
    pub const ERROR_FORMAT_NOT_SUPPORTED: i32 = -11;
    pub const ERROR_UNKNOWN: i32 = -13;
    pub const ERROR_SURFACE_LOST: i32 = -1000000000;
}

/// Command classes. Only the compositor exists today; the header reserves
/// room for future classes without changing the framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CommandClass {
    Compositor = 0,
}

impl CommandClass {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Compositor),
            _ => None,
        }
    }
}

/// Compositor command types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CompositorCommand {
    AllocateSwapchain = 0,
    Dequeue = 1,
    Queue = 2,
}

impl CompositorCommand {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::AllocateSwapchain),
            1 => Some(Self::Dequeue),
            2 => Some(Self::Queue),
            _ => None,
        }
    }
}

/// First bytes of every command datagram.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CommandHeader {
    pub class: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CompositorCommandHeader {
    pub header: CommandHeader,
    pub ty: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct Extent2d {
    pub width: u32,
    pub height: u32,
}

impl Extent2d {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// `ALLOCATE_SWAPCHAIN`: create a virtual swapchain of `image_count` images.
///
/// The response record is followed on the socket by `image_count` platform
/// buffer handles sent with the platform's out-of-band primitive, one per
/// image, *before* the response record itself is sent. Clients must consume
/// the handles first; this ordering is part of the protocol.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct AllocateSwapchain {
    pub header: CompositorCommandHeader,
    pub window_handle: i32,
    /// `VkFormat` raw value.
    pub format: i32,
    pub extent: Extent2d,
    /// `VkImageUsageFlags` raw value.
    pub usage: u32,
    /// `VkCompositeAlphaFlagsKHR` raw value.
    pub composite: u32,
    pub image_count: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct AllocateSwapchainResponse {
    pub result: i32,
    pub handle: SwapchainHandle,
}

/// `DEQUEUE`: acquire a free buffer, blocking up to `timeout_ns`.
///
/// `timeout_ns >= i64::MAX` waits indefinitely. The response carries one
/// sync-file fd: the buffer's acquire fence, or `-1` when the buffer has
/// never been composited (already signaled).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Dequeue {
    pub header: CompositorCommandHeader,
    pub handle: SwapchainHandle,
    /// Explicit padding so `timeout_ns` lands on its natural alignment,
    /// matching the C layout of the record.
    pub _pad: u32,
    pub timeout_ns: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DequeueResponse {
    pub result: i32,
    pub image_index: u32,
}

/// `QUEUE`: submit a previously dequeued buffer for composition.
///
/// Carries one sync fd the display loop will wait on before reading the
/// buffer; an absent fd (`-1`) means the buffer is already safe to read.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Queue {
    pub header: CompositorCommandHeader,
    pub handle: SwapchainHandle,
    pub image_index: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct QueueResponse {
    pub result: i32,
}

/// What a dispatched handler produced: how many response bytes and how many
/// fd slots it filled in the caller's scratch buffers.
#[derive(Debug, Clone, Copy)]
pub struct CommandInfo {
    pub num_bytes: usize,
    pub num_fds: usize,
}

pub fn compositor_header(ty: CompositorCommand) -> CompositorCommandHeader {
    CompositorCommandHeader {
        header: CommandHeader {
            class: CommandClass::Compositor as u32,
        },
        ty: ty as u32,
    }
}

/// Decodes a record from the front of a received datagram. The datagram may
/// be longer than the record; trailing bytes are ignored.
pub fn read_record<T: Pod>(data: &[u8]) -> Result<T, ProtocolError> {
    let need = std::mem::size_of::<T>();
    if data.len() < need {
        return Err(ProtocolError::Truncated {
            got: data.len(),
            need,
        });
    }
    Ok(bytemuck::pod_read_unaligned(&data[..need]))
}

/// Encodes a response record into the scratch buffer, returning its size.
pub fn write_record<T: Pod>(record: &T, out: &mut [u8]) -> usize {
    let bytes = bytemuck::bytes_of(record);
    out[..bytes.len()].copy_from_slice(bytes);
    bytes.len()
}
