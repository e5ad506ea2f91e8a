//! Socket server: listener, poll supervisor, per-connection workers.
//!
//! One supervisor thread polls the abstract-namespace listening socket and
//! every data socket. Inbound datagrams are forwarded to the connection's
//! worker thread, which dispatches them (a `dequeue` may block on the engine
//! condvar there without stalling other clients) and writes the response.
//! A hangup tears the connection down: the engine destroys its virtual
//! swapchains, which also cancels any dequeue still waiting on them.

use std::collections::HashMap;
use std::os::unix::io::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{
    accept4, bind, listen, socket, AddressFamily, Backlog, SockFlag, SockType, UnixAddr,
};

use crate::core::compositor::Compositor;
use crate::core::engine::ConnectionId;
use crate::core::protocol::{self, MAX_FDS_PER_MESSAGE, MAX_RESPONSE_SIZE};
use crate::core::transport::{self, InboundMessage, RecvOutcome};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Abstract-namespace socket name (no leading NUL; the address encoding
    /// adds it). Tests override this for isolation.
    pub socket_name: String,
    /// Listen backlog.
    pub backlog: i32,
    /// Enable the Vulkan validation layer in the GPU context.
    pub enable_validation: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_name: protocol::SOCKET_NAME.to_string(),
            backlog: 64,
            enable_validation: false,
        }
    }
}

struct Connection {
    id: ConnectionId,
    sock: Arc<OwnedFd>,
    tx: Sender<InboundMessage>,
    // Detached on teardown; the worker exits once its channel drains.
    _worker: JoinHandle<()>,
}

/// Accept/dispatch supervisor.
pub struct Server {
    compositor: Arc<Compositor>,
    listener: OwnedFd,
    connections: HashMap<RawFd, Connection>,
    next_connection_id: AtomicU64,
}

const POLL_INTERVAL_MS: u16 = 100;

impl Server {
    /// Binds the listening socket and exports its name to clients via the
    /// `CASSIA_SOCK` environment variable.
    pub fn bind(config: &ServerConfig, compositor: Arc<Compositor>) -> Result<Self> {
        let listener = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .context("failed to create server socket")?;
        let addr = UnixAddr::new_abstract(config.socket_name.as_bytes())
            .context("invalid abstract socket name")?;
        bind(listener.as_raw_fd(), &addr).context("failed to bind server socket")?;
        listen(
            &listener,
            Backlog::new(config.backlog).context("invalid listen backlog")?,
        )
        .context("failed to listen on server socket")?;

        std::env::set_var(protocol::SOCKET_ENV, &config.socket_name);
        tracing::info!("listening on abstract socket \"{}\"", config.socket_name);

        Ok(Self {
            compositor,
            listener,
            connections: HashMap::new(),
            next_connection_id: AtomicU64::new(1),
        })
    }

    /// Runs the supervisor loop until the compositor begins shutting down.
    pub fn run(&mut self) -> Result<()> {
        loop {
            if self.compositor.is_stopping() {
                break;
            }

            let mut accept_ready = false;
            let mut events: Vec<(RawFd, PollFlags)> = Vec::new();
            {
                let order: Vec<RawFd> = self.connections.keys().copied().collect();
                let mut pollfds = Vec::with_capacity(1 + order.len());
                pollfds.push(PollFd::new(self.listener.as_fd(), PollFlags::POLLIN));
                for &raw in &order {
                    pollfds.push(PollFd::new(
                        self.connections[&raw].sock.as_fd(),
                        PollFlags::POLLIN,
                    ));
                }

                match poll(&mut pollfds, PollTimeout::from(POLL_INTERVAL_MS)) {
                    Ok(0) => continue,
                    Ok(_) => {}
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(e) => return Err(e).context("poll failed"),
                }

                if let Some(revents) = pollfds[0].revents() {
                    accept_ready = revents.contains(PollFlags::POLLIN);
                }
                for (i, &raw) in order.iter().enumerate() {
                    if let Some(revents) = pollfds[i + 1].revents() {
                        if !revents.is_empty() {
                            events.push((raw, revents));
                        }
                    }
                }
            }

            if accept_ready {
                self.accept_one();
            }
            for (raw, revents) in events {
                if revents.contains(PollFlags::POLLIN) {
                    self.receive_one(raw);
                }
                if revents
                    .intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL)
                {
                    self.teardown(raw);
                }
            }
        }

        let remaining: Vec<RawFd> = self.connections.keys().copied().collect();
        for raw in remaining {
            self.teardown(raw);
        }
        Ok(())
    }

    fn accept_one(&mut self) {
        let sock = match accept4(self.listener.as_raw_fd(), SockFlag::SOCK_CLOEXEC) {
            Ok(fd) => unsafe { OwnedFd::from_raw_fd(fd) },
            Err(e) => {
                tracing::warn!("accept failed: {e}");
                return;
            }
        };
        let raw = sock.as_raw_fd();
        let id = ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed));
        let sock = Arc::new(sock);
        let (tx, rx) = std::sync::mpsc::channel();

        let worker = {
            let compositor = self.compositor.clone();
            let sock = sock.clone();
            match std::thread::Builder::new()
                .name(format!("cassiad-conn-{}", id.0))
                .spawn(move || connection_worker(compositor, id, sock, rx))
            {
                Ok(handle) => handle,
                Err(e) => {
                    tracing::error!("failed to spawn connection worker: {e}");
                    return;
                }
            }
        };

        tracing::info!("client connected: conn={}", id.0);
        self.connections.insert(
            raw,
            Connection {
                id,
                sock,
                tx,
                _worker: worker,
            },
        );
    }

    fn receive_one(&mut self, raw: RawFd) {
        let (id, tx) = match self.connections.get(&raw) {
            Some(conn) => (conn.id, conn.tx.clone()),
            None => return,
        };
        match transport::recv_message(raw) {
            Ok(RecvOutcome::Message(msg)) => {
                if tx.send(msg).is_err() {
                    // Worker already bailed out (fatal protocol error).
                    self.teardown(raw);
                }
            }
            Ok(RecvOutcome::KeepAlive) => {}
            Ok(RecvOutcome::Closed) => self.teardown(raw),
            Err(e) => {
                tracing::warn!("conn={}: receive failed: {e}", id.0);
                self.teardown(raw);
            }
        }
    }

    /// Removes the connection and frees everything it owns. In-flight
    /// dequeue waits on its swapchains return a cancellation error.
    fn teardown(&mut self, raw: RawFd) {
        let Some(conn) = self.connections.remove(&raw) else {
            return;
        };
        tracing::info!("client disconnected: conn={}", conn.id.0);
        self.compositor.engine().destroy_connection(conn.id);
        // Unblock a worker sitting in sendmsg, then let it drain and exit;
        // the socket closes when the last Arc reference drops with it.
        let _ = nix::sys::socket::shutdown(raw, nix::sys::socket::Shutdown::Both);
        drop(conn.tx);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

fn connection_worker(
    compositor: Arc<Compositor>,
    id: ConnectionId,
    sock: Arc<OwnedFd>,
    rx: Receiver<InboundMessage>,
) {
    while let Ok(mut msg) = rx.recv() {
        let mut response = [0u8; MAX_RESPONSE_SIZE];
        let mut response_fds = [-1 as RawFd; MAX_FDS_PER_MESSAGE];
        let (data, fds) = msg.parts();
        let info = match compositor.dispatch(
            id,
            sock.as_raw_fd(),
            data,
            fds,
            &mut response,
            &mut response_fds,
        ) {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!("conn={}: fatal command error: {e}", id.0);
                let _ = nix::sys::socket::shutdown(
                    sock.as_raw_fd(),
                    nix::sys::socket::Shutdown::Both,
                );
                break;
            }
        };
        if let Err(e) = transport::send_message(
            sock.as_raw_fd(),
            &response[..info.num_bytes],
            &response_fds[..info.num_fds],
        ) {
            tracing::debug!("conn={}: response send failed: {e}", id.0);
            break;
        }
    }
}
