//! Error taxonomy
//!
//! Every fallible socket operation returns [`SrtError`]. Each error belongs to
//! a major category and carries a minor code within it; `code()` combines
//! them as `1000 * major + minor`.

use crate::buffer::BufferError;
use crate::handshake::{HandshakeError, RejectReason};
use crate::packet::PacketError;
use srt_crypto::CryptoError;
use srt_io::{EpollError, SocketError};
use thiserror::Error;

/// Major error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorMajor {
    Setup = 1,
    Connection = 2,
    SystemResource = 3,
    FileSystem = 4,
    NotSupported = 5,
    Again = 6,
    PeerError = 7,
}

/// Errors reported by the socket API
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SrtError {
    // Setup
    #[error("Connection setup failure")]
    ConnectionSetup,

    #[error("Connection setup failure: connection timed out")]
    SetupTimeout,

    #[error("Connection setup failure: connection rejected ({0})")]
    ConnectionRejected(RejectReason),

    #[error("Connection setup failure: unable to create/configure socket: {0}")]
    SocketFailure(String),

    #[error("Connection setup failure: aborted for security reasons")]
    SecurityFailure,

    // Connection
    #[error("Connection was broken")]
    ConnectionLost,

    #[error("Connection does not exist")]
    NoConnection,

    #[error("Socket is closing")]
    Closing,

    // System resources
    #[error("System resource failure: unable to create new threads")]
    ThreadFailure,

    #[error("System resource failure: unable to allocate buffers")]
    NoBuffer,

    // Not supported
    #[error("Operation not supported: cannot do this operation on a bound socket")]
    BoundSocket,

    #[error("Operation not supported: cannot do this operation on a connected socket")]
    ConnectedSocket,

    #[error("Operation not supported: invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Operation not supported: invalid socket id")]
    InvalidSocket,

    #[error("Operation not supported: cannot do this operation on an unbound socket")]
    UnboundSocket,

    #[error("Operation not supported: socket is not in listening state")]
    NoListen,

    #[error("Operation not supported: listen/accept is not supported in rendezvous connection setup")]
    RendezvousNoServer,

    #[error("Operation not supported: cannot call connect on an unbound socket in rendezvous connection setup")]
    RendezvousUnbound,

    #[error("Operation not supported: incorrect use of message API (sendmsg/recvmsg)")]
    InvalidMessageApi,

    #[error("Operation not supported: incorrect use of buffer API (send/recv)")]
    InvalidBufferApi,

    #[error("Operation not supported: another socket is already listening on the same port")]
    DuplicateListen,

    #[error("Operation not supported: message is too large to send")]
    LargeMessage,

    #[error("Operation not supported: invalid epoll id")]
    InvalidPollId,

    // Again
    #[error("Non-blocking call failure: no buffer available for sending")]
    AsyncSend,

    #[error("Non-blocking call failure: no data available for reading")]
    AsyncRecv,

    #[error("Non-blocking call failure: transmission timed out")]
    Timeout,

    #[error("Non-blocking call failure: early congestion notification")]
    Congestion,

    // Peer
    #[error("The peer side has signalled an error: {0}")]
    Peer(u32),
}

impl SrtError {
    pub fn major(&self) -> ErrorMajor {
        use SrtError::*;
        match self {
            ConnectionSetup
            | SetupTimeout
            | ConnectionRejected(_)
            | SocketFailure(_)
            | SecurityFailure => ErrorMajor::Setup,
            ConnectionLost | NoConnection | Closing => ErrorMajor::Connection,
            ThreadFailure | NoBuffer => ErrorMajor::SystemResource,
            BoundSocket
            | ConnectedSocket
            | InvalidParam(_)
            | InvalidSocket
            | UnboundSocket
            | NoListen
            | RendezvousNoServer
            | RendezvousUnbound
            | InvalidMessageApi
            | InvalidBufferApi
            | DuplicateListen
            | LargeMessage
            | InvalidPollId => ErrorMajor::NotSupported,
            AsyncSend | AsyncRecv | Timeout | Congestion => ErrorMajor::Again,
            Peer(_) => ErrorMajor::PeerError,
        }
    }

    pub fn minor(&self) -> u32 {
        use SrtError::*;
        match self {
            ConnectionSetup | Peer(_) => 0,
            SetupTimeout => 1,
            ConnectionRejected(_) => 2,
            SocketFailure(_) => 3,
            SecurityFailure => 4,
            ConnectionLost => 1,
            NoConnection | Closing => 2,
            ThreadFailure => 1,
            NoBuffer => 2,
            BoundSocket => 1,
            ConnectedSocket => 2,
            InvalidParam(_) => 3,
            InvalidSocket => 4,
            UnboundSocket => 5,
            NoListen => 6,
            RendezvousNoServer => 7,
            RendezvousUnbound => 8,
            InvalidMessageApi => 9,
            InvalidBufferApi => 10,
            DuplicateListen => 11,
            LargeMessage => 12,
            InvalidPollId => 13,
            AsyncSend => 1,
            AsyncRecv => 2,
            Timeout => 3,
            Congestion => 4,
        }
    }

    /// Combined numeric code
    pub fn code(&self) -> i32 {
        (1000 * self.major() as u32 + self.minor()) as i32
    }

    /// Transient condition; the caller may retry
    pub fn is_again(&self) -> bool {
        self.major() == ErrorMajor::Again
    }

    pub(crate) fn invalid(what: impl Into<String>) -> Self {
        SrtError::InvalidParam(what.into())
    }
}

impl From<BufferError> for SrtError {
    fn from(err: BufferError) -> Self {
        match err {
            BufferError::Full => SrtError::AsyncSend,
            BufferError::MessageTooLarge { .. } => SrtError::LargeMessage,
            BufferError::EmptyMessage => SrtError::invalid("empty message"),
        }
    }
}

impl From<CryptoError> for SrtError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InvalidPassphraseLength(_) | CryptoError::InvalidKeyLength(_) => {
                SrtError::InvalidParam(err.to_string())
            }
            _ => SrtError::SecurityFailure,
        }
    }
}

impl From<SocketError> for SrtError {
    fn from(err: SocketError) -> Self {
        SrtError::SocketFailure(err.to_string())
    }
}

impl From<EpollError> for SrtError {
    fn from(err: EpollError) -> Self {
        match err {
            EpollError::Timeout => SrtError::Timeout,
            EpollError::InvalidId(_) | EpollError::NotRegistered(_) | EpollError::EmptySet => {
                SrtError::InvalidPollId
            }
        }
    }
}

impl From<HandshakeError> for SrtError {
    fn from(_: HandshakeError) -> Self {
        SrtError::ConnectionSetup
    }
}

impl From<PacketError> for SrtError {
    fn from(err: PacketError) -> Self {
        match err {
            PacketError::PayloadTooLarge { .. } => SrtError::LargeMessage,
            _ => SrtError::ConnectionSetup,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(SrtError::SetupTimeout.code(), 1001);
        assert_eq!(
            SrtError::ConnectionRejected(RejectReason::BadSecret).code(),
            1002
        );
        assert_eq!(SrtError::ConnectionLost.code(), 2001);
        assert_eq!(SrtError::NoConnection.code(), 2002);
        assert_eq!(SrtError::InvalidPollId.code(), 5013);
        assert_eq!(SrtError::AsyncRecv.code(), 6002);
        assert_eq!(SrtError::Peer(0).code(), 7000);
    }

    #[test]
    fn test_again_class() {
        assert!(SrtError::AsyncSend.is_again());
        assert!(SrtError::Timeout.is_again());
        assert!(!SrtError::ConnectionLost.is_again());
    }

    #[test]
    fn test_conversions() {
        assert_eq!(SrtError::from(BufferError::Full), SrtError::AsyncSend);
        assert_eq!(SrtError::from(EpollError::EmptySet), SrtError::InvalidPollId);
        assert_eq!(
            SrtError::from(CryptoError::IntegrityCheckFailed),
            SrtError::SecurityFailure
        );
        assert!(matches!(
            SrtError::from(CryptoError::InvalidPassphraseLength(3)),
            SrtError::InvalidParam(_)
        ));
    }

    #[test]
    fn test_display() {
        let text = SrtError::ConnectionRejected(RejectReason::BadSecret).to_string();
        assert!(text.contains("rejected"));
    }
}
