//! SRT Protocol Core Implementation
//!
//! This crate implements the core SRT (Secure Reliable Transport) protocol:
//! packet and control formats, the handshake and its negotiation, buffers,
//! loss tracking, ACK/NAK timing, congestion control, TSBPD and the
//! sans-I/O connection engine. Sockets and threads live in the `srt` crate.

pub mod ack;
pub mod buffer;
pub mod congestion;
pub mod connection;
pub mod control;
pub mod error;
pub mod handshake;
pub mod loss;
pub mod negotiation;
pub mod options;
pub mod packet;
pub mod sequence;
pub mod stats;
pub mod tsbpd;

pub use ack::{AckTimer, AckWindow, RttEstimator};
pub use buffer::{BufferError, Delivery, ReceiveBuffer, SendBuffer};
pub use congestion::{BandwidthLimit, CongestionControl, CongestionKind};
pub use connection::{BreakReason, Connection, LinkState, SocketStatus};
pub use control::{AckInfo, ControlMessage};
pub use error::{ErrorMajor, SrtError};
pub use handshake::{Handshake, HandshakeError, HandshakeType, RejectReason};
pub use loss::{LossRange, ReceiverLossList, SenderLossList};
pub use negotiation::{
    CallerHandshake, CookieJar, HandshakeStep, ListenerHandshake, ListenerStep, Negotiated,
    RendezvousHandshake, RendezvousRole,
};
pub use options::{OptBinding, OptValue, SockOpt, SocketOptions, TransType};
pub use packet::{ControlPacket, ControlType, DataPacket, MsgNumber, Packet, PacketBoundary};
pub use sequence::SeqNumber;
pub use stats::{Counters, Instantaneous, PerfMon, TraceStats};
pub use tsbpd::TsbpdClock;
