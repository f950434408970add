//! SRT I/O and Platform Abstraction
//!
//! This crate provides network I/O and platform-specific abstractions:
//! the UDP channel wrapper, packet timestamps and the readiness
//! multiplexer used by the epoll API.

pub mod epoll;
pub mod socket;
pub mod time;

pub use epoll::{Epoll, EpollError, EventFlags, EventSource, Notifier, ReadyEvent, SourceId};
pub use socket::{ChannelOptions, SocketError, UdpChannel};
pub use time::srt_timestamp;
