//! Client-side protocol helpers.
//!
//! The thin connect/transact layer a client links against: one synchronous
//! call per command, with the allocation reply's out-of-band platform
//! handles consumed between command send and response receive, in protocol
//! order. Used by the smoke client and the end-to-end tests; the
//! translation-layer client embeds the same sequence.

use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};

use bytemuck::Pod;
use nix::sys::socket::{connect, socket, AddressFamily, SockFlag, SockType, UnixAddr};

use crate::core::errors::{CoreError, Result};
use crate::core::protocol::{
    self, compositor_header, AllocateSwapchainResponse, CompositorCommand, DequeueResponse,
    Extent2d, QueueResponse, SwapchainHandle, MAX_COMMAND_SIZE,
};
use crate::core::transport::{self, RecvFds, RecvOutcome};
use crate::util::fd::SyncFd;

/// One connection to the compositor server.
pub struct Client {
    sock: OwnedFd,
}

impl Client {
    /// Connects to the abstract-namespace socket `name`.
    pub fn connect(name: &str) -> Result<Self> {
        let sock = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        let addr = UnixAddr::new_abstract(name.as_bytes())?;
        connect(sock.as_raw_fd(), &addr)?;
        Ok(Self { sock })
    }

    /// Connects to the name exported in `CASSIA_SOCK`, falling back to the
    /// default socket name.
    pub fn connect_env() -> Result<Self> {
        let name = std::env::var(protocol::SOCKET_ENV)
            .unwrap_or_else(|_| protocol::SOCKET_NAME.to_string());
        Self::connect(&name)
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    fn send_command<T: Pod>(&self, command: &T, fds: &[RawFd]) -> Result<()> {
        let mut buf = [0u8; MAX_COMMAND_SIZE];
        let len = protocol::write_record(command, &mut buf);
        transport::send_message(self.sock.as_raw_fd(), &buf[..len], fds)?;
        Ok(())
    }

    fn recv_response<T: Pod>(&self) -> Result<(T, RecvFds)> {
        loop {
            match transport::recv_message(self.sock.as_raw_fd())? {
                RecvOutcome::Message(msg) => {
                    let record: T = protocol::read_record(msg.data())?;
                    return Ok((record, msg.fds));
                }
                RecvOutcome::KeepAlive => {
                    // Zero bytes is either a keep-alive or EOF; only the
                    // socket state tells them apart.
                    if transport::peer_hung_up(self.sock.as_raw_fd())? {
                        return Err(CoreError::PeerClosed);
                    }
                    continue;
                }
                RecvOutcome::Closed => return Err(CoreError::PeerClosed),
            }
        }
    }

    /// Receives one raw out-of-band platform handle datagram. On device the
    /// translation layer calls the platform's handle-receive primitive here
    /// instead.
    pub fn recv_handle_blob(&self) -> Result<Vec<u8>> {
        match transport::recv_message(self.sock.as_raw_fd())? {
            RecvOutcome::Message(msg) => Ok(msg.data().to_vec()),
            RecvOutcome::KeepAlive => Ok(Vec::new()),
            RecvOutcome::Closed => Err(CoreError::PeerClosed),
        }
    }

    /// Allocates a virtual swapchain. `recv_handle` is invoked once per
    /// image between the command send and the response receive, and must
    /// consume one platform buffer handle from the socket (see
    /// [`Client::recv_handle_blob`]).
    #[allow(clippy::too_many_arguments)]
    pub fn allocate_swapchain(
        &self,
        window_handle: i32,
        format: i32,
        extent: Extent2d,
        usage: u32,
        composite: u32,
        image_count: u32,
        mut recv_handle: impl FnMut(&Self) -> Result<()>,
    ) -> Result<AllocateSwapchainResponse> {
        let command = protocol::AllocateSwapchain {
            header: compositor_header(CompositorCommand::AllocateSwapchain),
            window_handle,
            format,
            extent,
            usage,
            composite,
            image_count,
        };
        self.send_command(&command, &[])?;
        // Handles arrive before the response record; consume them first.
        for _ in 0..image_count {
            recv_handle(self)?;
        }
        let (response, _fds) = self.recv_response::<AllocateSwapchainResponse>()?;
        Ok(response)
    }

    /// Dequeues a buffer; returns the response and the acquire fence
    /// (signaled sentinel when no fence was transmitted).
    pub fn dequeue(
        &self,
        handle: SwapchainHandle,
        timeout_ns: u64,
    ) -> Result<(DequeueResponse, SyncFd)> {
        let command = protocol::Dequeue {
            header: compositor_header(CompositorCommand::Dequeue),
            handle,
            _pad: 0,
            timeout_ns,
        };
        self.send_command(&command, &[])?;
        let (response, mut fds) = self.recv_response::<DequeueResponse>()?;
        Ok((response, SyncFd::from_raw(fds.take(0))))
    }

    /// Queues a rendered buffer. Ownership of `fence` moves to the call;
    /// pass the signaled sentinel when rendering is already done.
    pub fn queue(
        &self,
        handle: SwapchainHandle,
        image_index: u32,
        mut fence: SyncFd,
    ) -> Result<QueueResponse> {
        let command = protocol::Queue {
            header: compositor_header(CompositorCommand::Queue),
            handle,
            image_index,
        };
        self.send_command(&command, &[fence.take()])?;
        let (response, _fds) = self.recv_response::<QueueResponse>()?;
        Ok(response)
    }

    /// Sends an empty keep-alive datagram.
    pub fn ping(&self) -> Result<()> {
        transport::send_message(self.sock.as_raw_fd(), &[], &[])?;
        Ok(())
    }
}
