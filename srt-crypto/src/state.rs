//! Key material state and key parity

/// Key material exchange state of one direction
///
/// Values match the numbers reported through the KMSTATE options and
/// carried in a failing KMRSP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum KmState {
    /// No encryption configured
    #[default]
    Unsecured = 0,
    /// Key material sent or expected, exchange not finished
    Securing = 1,
    /// Keys exchanged, payloads can be decrypted
    Secured = 2,
    /// Peer encrypts but this side has no passphrase (or the reverse)
    NoSecret = 3,
    /// Passphrases differ
    BadSecret = 4,
}

impl KmState {
    /// Whether moving from `self` to `to` is allowed
    ///
    /// UNSECURED may only start securing; SECURING resolves into exactly one
    /// of the three outcomes, which stay until teardown.
    pub fn can_transition(self, to: KmState) -> bool {
        use KmState::*;
        matches!(
            (self, to),
            (Unsecured, Securing) | (Securing, Secured) | (Securing, NoSecret) | (Securing, BadSecret)
        )
    }

    /// Whether the exchange has finished (successfully or not)
    pub fn is_terminal(self) -> bool {
        matches!(self, KmState::Secured | KmState::NoSecret | KmState::BadSecret)
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(KmState::Unsecured),
            1 => Some(KmState::Securing),
            2 => Some(KmState::Secured),
            3 => Some(KmState::NoSecret),
            4 => Some(KmState::BadSecret),
            _ => None,
        }
    }
}

/// Which of the two key slots encrypted a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyParity {
    Even,
    Odd,
}

impl KeyParity {
    /// Key-encryption flag bits as carried in the message number word
    pub fn flag(self) -> u8 {
        match self {
            KeyParity::Even => 0b01,
            KeyParity::Odd => 0b10,
        }
    }

    /// Decode the 2-bit key flag of a data packet (0 = not encrypted)
    pub fn from_flag(flag: u8) -> Option<Self> {
        match flag & 0b11 {
            0b01 => Some(KeyParity::Even),
            0b10 => Some(KeyParity::Odd),
            _ => None,
        }
    }

    pub fn other(self) -> Self {
        match self {
            KeyParity::Even => KeyParity::Odd,
            KeyParity::Odd => KeyParity::Even,
        }
    }
}
