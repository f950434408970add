//! UDP channel for SRT
//!
//! Wraps the datagram socket every SRT multiplexer sends and receives on,
//! exposing the handful of socket options the SRT option set passes through
//! (buffer sizes, address reuse, IP TTL and TOS).

use crate::epoll::{EventFlags, EventSource};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Socket configuration errors
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid socket address")]
    InvalidAddress,
}

/// Options applied to a channel before it is bound
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelOptions {
    /// Allow binding a port another socket already uses
    pub reuse_addr: bool,
    /// Kernel send buffer size (bytes), `None` keeps the OS default
    pub send_buffer: Option<usize>,
    /// Kernel receive buffer size (bytes), `None` keeps the OS default
    pub recv_buffer: Option<usize>,
    /// IP time-to-live
    pub ip_ttl: Option<u32>,
    /// IP type-of-service
    pub ip_tos: Option<u32>,
}

/// UDP channel
///
/// One channel is shared by every SRT socket bound to the same local
/// address. Reads block for at most the configured read timeout so the
/// receiving thread can notice shutdown.
pub struct UdpChannel {
    inner: Socket,
    nonblocking: AtomicBool,
}

impl UdpChannel {
    /// Create a channel bound to the given address
    pub fn bind(addr: SocketAddr, options: ChannelOptions) -> Result<Self, SocketError> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(options.reuse_addr)?;

        if let Some(size) = options.send_buffer {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(size) = options.recv_buffer {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(ttl) = options.ip_ttl {
            if addr.is_ipv4() {
                socket.set_ttl(ttl)?;
            } else {
                socket.set_unicast_hops_v6(ttl)?;
            }
        }
        if let Some(tos) = options.ip_tos {
            if addr.is_ipv4() {
                socket.set_tos(tos)?;
            }
        }

        socket.bind(&addr.into())?;

        tracing::debug!(%addr, "UDP channel bound");

        Ok(UdpChannel {
            inner: socket,
            nonblocking: AtomicBool::new(false),
        })
    }

    /// Wrap an already bound standard UDP socket
    pub fn from_udp_socket(socket: UdpSocket) -> Self {
        UdpChannel {
            inner: Socket::from(socket),
            nonblocking: AtomicBool::new(false),
        }
    }

    /// Limit how long `recv_from` blocks
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), SocketError> {
        self.inner.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Switch non-blocking mode
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<(), SocketError> {
        self.inner.set_nonblocking(nonblocking)?;
        self.nonblocking.store(nonblocking, Ordering::Release);
        Ok(())
    }

    /// Get the send buffer size
    pub fn send_buffer_size(&self) -> Result<usize, SocketError> {
        Ok(self.inner.send_buffer_size()?)
    }

    /// Get the receive buffer size
    pub fn recv_buffer_size(&self) -> Result<usize, SocketError> {
        Ok(self.inner.recv_buffer_size()?)
    }

    /// Get the local address this channel is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        self.inner
            .local_addr()?
            .as_socket()
            .ok_or(SocketError::InvalidAddress)
    }

    /// Send a datagram to the given address
    pub fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, SocketError> {
        Ok(self.inner.send_to(buf, &target.into())?)
    }

    /// Receive a datagram
    ///
    /// Returns `None` when the read timed out or the channel is
    /// non-blocking and nothing is queued.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, SocketError> {
        use std::mem::MaybeUninit;
        // SAFETY: recv_from only writes initialized bytes into the buffer and
        // reports how many; u8 has no invalid bit patterns.
        let uninit_buf = unsafe {
            std::slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut MaybeUninit<u8>, buf.len())
        };

        match self.inner.recv_from(uninit_buf) {
            Ok((n, addr)) => Ok(Some((n, addr.as_socket().ok_or(SocketError::InvalidAddress)?))),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(SocketError::Io(e)),
        }
    }

    /// Try to clone the channel
    pub fn try_clone(&self) -> Result<Self, SocketError> {
        Ok(UdpChannel {
            inner: self.inner.try_clone()?,
            nonblocking: AtomicBool::new(self.nonblocking.load(Ordering::Acquire)),
        })
    }
}

/// External descriptors take part in readiness waits through this impl.
///
/// Readability can only be probed without consuming data when the channel
/// is non-blocking; a blocking channel reports write readiness only.
impl EventSource for UdpChannel {
    fn readiness(&self) -> EventFlags {
        let mut flags = EventFlags::OUT;

        if let Ok(Some(_)) = self.inner.take_error() {
            flags |= EventFlags::ERR;
        }

        if self.nonblocking.load(Ordering::Acquire) {
            match self.inner.peek_sender() {
                Ok(_) => flags |= EventFlags::IN,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(_) => flags |= EventFlags::ERR,
            }
        }

        flags
    }
}
