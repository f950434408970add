//! SRT - Secure Reliable Transport
//!
//! Socket-style API over the SRT protocol engine: sockets addressed by id,
//! one multiplexer (receiver and timer threads) per bound UDP port, blocking
//! or non-blocking calls, and epoll-style readiness waiting.

mod engine;
mod multiplexer;
mod socket;

pub use srt_crypto as crypto;
pub use srt_io as io;
pub use srt_protocol as protocol;

pub use engine::{SocketId, Srt};
pub use socket::MsgCtrl;

// Re-export commonly used types
pub use crypto::KmState;
pub use io::{EventFlags, EventSource, ReadyEvent, SourceId, UdpChannel};
pub use protocol::{
    ErrorMajor, MsgNumber, OptValue, PacketBoundary, PerfMon, SeqNumber, SockOpt,
    SocketOptions, SocketStatus, SrtError, TraceStats, TransType,
};
