//! Datagram transport with ancillary file descriptors.
//!
//! One call moves one command or response datagram, together with up to
//! [`MAX_FDS_PER_MESSAGE`] descriptors in a single `SCM_RIGHTS` record.
//! Datagram boundaries are preserved by the SOCK_SEQPACKET transport, so a
//! short read of a record is impossible by construction.
//!
//! Outbound fd encoding:
//! - zero fds: no ancillary block;
//! - exactly one fd with value `-1`: no ancillary block — the receiver
//!   materializes the absence as `-1` ("pre-signaled sync primitive");
//! - otherwise the declared fds are sent in one `SCM_RIGHTS` record.
//!
//! After a send the transmitted descriptors are closed here: ownership moved
//! to the kernel and duplicates surface in the receiver.

use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::RawFd;

use nix::sys::socket::{self, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr};

use crate::core::protocol::{MAX_COMMAND_SIZE, MAX_FDS_PER_MESSAGE};
use crate::util::fd::close_raw;

/// Descriptors received with one datagram. Slots that carried no fd hold
/// `-1`; a command that expects an fd but received none reads `-1`, which
/// the semaphore import path treats as "already signaled".
///
/// Owns every non-`-1` entry: whatever dispatch does not [`take`](Self::take)
/// is closed on drop.
#[derive(Debug)]
pub struct RecvFds {
    fds: [RawFd; MAX_FDS_PER_MESSAGE],
}

impl RecvFds {
    fn new() -> Self {
        Self {
            fds: [-1; MAX_FDS_PER_MESSAGE],
        }
    }

    /// Moves slot `index` out, leaving `-1` behind.
    pub fn take(&mut self, index: usize) -> RawFd {
        std::mem::replace(&mut self.fds[index], -1)
    }

    pub fn get(&self, index: usize) -> RawFd {
        self.fds[index]
    }

    pub fn count(&self) -> usize {
        self.fds.iter().filter(|&&fd| fd >= 0).count()
    }
}

impl Drop for RecvFds {
    fn drop(&mut self) {
        for &fd in &self.fds {
            close_raw(fd);
        }
    }
}

/// One received command datagram.
pub struct InboundMessage {
    data: [u8; MAX_COMMAND_SIZE],
    len: usize,
    pub fds: RecvFds,
}

impl InboundMessage {
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Splits the message into its payload and its fd set, so dispatch can
    /// read one while consuming the other.
    pub fn parts(&mut self) -> (&[u8], &mut RecvFds) {
        (&self.data[..self.len], &mut self.fds)
    }
}

pub enum RecvOutcome {
    Message(InboundMessage),
    /// Empty datagram: ignored. (An orderly shutdown also reads as zero
    /// bytes; the poll supervisor tells the two apart via POLLHUP.)
    KeepAlive,
    /// The peer reset the connection.
    Closed,
}

/// Receives one datagram and its ancillary descriptors.
pub fn recv_message(sock: RawFd) -> nix::Result<RecvOutcome> {
    let mut data = [0u8; MAX_COMMAND_SIZE];
    let mut fds = RecvFds::new();
    let len;
    {
        let mut iov = [IoSliceMut::new(&mut data)];
        let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_FDS_PER_MESSAGE]);
        let msg = match socket::recvmsg::<UnixAddr>(
            sock,
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::MSG_CMSG_CLOEXEC,
        ) {
            Ok(msg) => msg,
            Err(nix::errno::Errno::ECONNRESET) => return Ok(RecvOutcome::Closed),
            Err(e) => return Err(e),
        };
        if msg.flags.contains(MsgFlags::MSG_TRUNC) {
            // A datagram above the command cap is a protocol violation.
            return Err(nix::errno::Errno::EMSGSIZE);
        }
        len = msg.bytes;

        let mut slot = 0;
        for cmsg in msg.cmsgs()? {
            if let ControlMessageOwned::ScmRights(received) = cmsg {
                for fd in received {
                    if slot < MAX_FDS_PER_MESSAGE {
                        fds.fds[slot] = fd;
                        slot += 1;
                    } else {
                        close_raw(fd);
                    }
                }
            }
        }
    }

    if len == 0 && fds.count() == 0 {
        return Ok(RecvOutcome::KeepAlive);
    }
    Ok(RecvOutcome::Message(InboundMessage { data, len, fds }))
}

/// True when the peer has hung up. A zero-byte read is ambiguous on a
/// SEQPACKET socket (keep-alive or EOF); the poll supervisor resolves it
/// through POLLHUP, and synchronous receivers use this probe instead.
pub fn peer_hung_up(sock: RawFd) -> nix::Result<bool> {
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    use std::os::unix::io::BorrowedFd;

    let borrowed = unsafe { BorrowedFd::borrow_raw(sock) };
    let mut fds = [PollFd::new(borrowed, PollFlags::empty())];
    poll(&mut fds, PollTimeout::ZERO)?;
    Ok(fds[0]
        .revents()
        .is_some_and(|revents| revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR)))
}

/// Sends one datagram with the declared descriptors, then closes every
/// descriptor handed in (ownership transfers to this call).
pub fn send_message(sock: RawFd, data: &[u8], fds: &[RawFd]) -> nix::Result<()> {
    let iov = [IoSlice::new(data)];
    let with_ancillary = fds.len() > 1 || (fds.len() == 1 && fds[0] != -1);

    let result = if with_ancillary {
        let cmsgs = [ControlMessage::ScmRights(fds)];
        socket::sendmsg::<UnixAddr>(sock, &iov, &cmsgs, MsgFlags::MSG_NOSIGNAL, None)
    } else {
        socket::sendmsg::<UnixAddr>(sock, &iov, &[], MsgFlags::MSG_NOSIGNAL, None)
    };

    for &fd in fds {
        close_raw(fd);
    }

    result.map(drop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use std::os::unix::io::{AsRawFd, IntoRawFd, OwnedFd};

    fn pair() -> (OwnedFd, OwnedFd) {
        socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .unwrap()
    }

    fn devnull_fd() -> RawFd {
        std::fs::File::open("/dev/null").unwrap().into_raw_fd()
    }

    fn fd_is_open(fd: RawFd) -> bool {
        unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
    }

    #[test]
    fn test_roundtrip_no_fds() {
        let (a, b) = pair();
        send_message(a.as_raw_fd(), b"hello", &[]).unwrap();
        match recv_message(b.as_raw_fd()).unwrap() {
            RecvOutcome::Message(msg) => {
                assert_eq!(msg.data(), b"hello");
                assert_eq!(msg.fds.count(), 0);
                assert_eq!(msg.fds.get(0), -1);
            }
            _ => panic!("expected a message"),
        }
    }

    #[test]
    fn test_roundtrip_one_fd() {
        let (a, b) = pair();
        let fd = devnull_fd();
        send_message(a.as_raw_fd(), b"x", &[fd]).unwrap();
        // Sender side closed its copy.
        assert!(!fd_is_open(fd));

        match recv_message(b.as_raw_fd()).unwrap() {
            RecvOutcome::Message(mut msg) => {
                assert_eq!(msg.fds.count(), 1);
                let got = msg.fds.take(0);
                assert!(got >= 0);
                assert!(fd_is_open(got));
                close_raw(got);
            }
            _ => panic!("expected a message"),
        }
    }

    #[test]
    fn test_minus_one_fd_elides_ancillary() {
        // A declared fd of -1 must arrive with no ancillary data at all and
        // read back as -1.
        let (a, b) = pair();
        send_message(a.as_raw_fd(), b"t", &[-1]).unwrap();
        match recv_message(b.as_raw_fd()).unwrap() {
            RecvOutcome::Message(msg) => {
                assert_eq!(msg.fds.count(), 0);
                assert_eq!(msg.fds.get(0), -1);
            }
            _ => panic!("expected a message"),
        }
    }

    #[test]
    fn test_multiple_fds() {
        let (a, b) = pair();
        let fds = [devnull_fd(), devnull_fd(), devnull_fd()];
        send_message(a.as_raw_fd(), b"m", &fds).unwrap();
        match recv_message(b.as_raw_fd()).unwrap() {
            RecvOutcome::Message(mut msg) => {
                assert_eq!(msg.fds.count(), 3);
                for i in 0..3 {
                    close_raw(msg.fds.take(i));
                }
            }
            _ => panic!("expected a message"),
        }
    }

    #[test]
    fn test_empty_datagram_is_keepalive() {
        let (a, b) = pair();
        send_message(a.as_raw_fd(), &[], &[]).unwrap();
        assert!(matches!(
            recv_message(b.as_raw_fd()).unwrap(),
            RecvOutcome::KeepAlive
        ));
    }

    #[test]
    fn test_recv_fds_drop_closes_untaken() {
        let (a, b) = pair();
        send_message(a.as_raw_fd(), b"x", &[devnull_fd(), devnull_fd()]).unwrap();
        let (kept, dropped) = match recv_message(b.as_raw_fd()).unwrap() {
            RecvOutcome::Message(mut msg) => {
                let kept = msg.fds.take(0);
                let dropped = msg.fds.get(1);
                drop(msg);
                (kept, dropped)
            }
            _ => panic!("expected a message"),
        };
        assert!(fd_is_open(kept));
        assert!(!fd_is_open(dropped));
        close_raw(kept);
    }
}
