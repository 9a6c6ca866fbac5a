//! Close codes and close frame payloads (RFC 6455 section 7.4).

use crate::{ProtocolError, Role};
use bytes::{BufMut, Bytes, BytesMut};

/// Largest reason that fits in a control frame after the two code bytes.
pub const MAX_REASON_LEN: usize = 123;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// 1000
    Normal,
    /// 1001
    GoingAway,
    /// 1002
    Protocol,
    /// 1003
    Unsupported,
    /// 1005, local only: the close frame carried no code.
    NoStatus,
    /// 1006, local only: the connection dropped without a close frame.
    Abnormal,
    /// 1007
    InvalidPayload,
    /// 1008
    Policy,
    /// 1009
    TooBig,
    /// 1010
    MandatoryExtension,
    /// 1011
    Internal,
    /// 1012
    ServiceRestart,
    /// 1013
    TryAgainLater,
    /// 1014
    BadGateway,
    /// 1015, local only.
    TlsHandshake,
    /// Anything else, including the 3000-4999 application range.
    Other(u16),
}

impl CloseCode {
    /// Whether a peer may put this code in a close frame.
    pub fn is_valid_on_wire(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
    }

    /// The code to actually send when asked to close with `self`.
    ///
    /// Local-only codes become 1000, and so do 1012 and 1013 on a client.
    pub fn to_sendable(self, role: Role) -> CloseCode {
        match (self, role) {
            (CloseCode::NoStatus | CloseCode::Abnormal | CloseCode::TlsHandshake, _) => {
                CloseCode::Normal
            }
            (CloseCode::ServiceRestart | CloseCode::TryAgainLater, Role::Client) => {
                CloseCode::Normal
            }
            (CloseCode::Other(code), _) if !CloseCode::is_valid_on_wire(code) => {
                CloseCode::Normal
            }
            (code, _) => code,
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::GoingAway,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1005 => CloseCode::NoStatus,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::InvalidPayload,
            1008 => CloseCode::Policy,
            1009 => CloseCode::TooBig,
            1010 => CloseCode::MandatoryExtension,
            1011 => CloseCode::Internal,
            1012 => CloseCode::ServiceRestart,
            1013 => CloseCode::TryAgainLater,
            1014 => CloseCode::BadGateway,
            1015 => CloseCode::TlsHandshake,
            other => CloseCode::Other(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::NoStatus => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::InvalidPayload => 1007,
            CloseCode::Policy => 1008,
            CloseCode::TooBig => 1009,
            CloseCode::MandatoryExtension => 1010,
            CloseCode::Internal => 1011,
            CloseCode::ServiceRestart => 1012,
            CloseCode::TryAgainLater => 1013,
            CloseCode::BadGateway => 1014,
            CloseCode::TlsHandshake => 1015,
            CloseCode::Other(other) => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: CloseCode,
    pub reason: String,
}

impl CloseReason {
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        CloseReason {
            code,
            reason: reason.into(),
        }
    }

    pub fn normal() -> Self {
        CloseReason::new(CloseCode::Normal, "")
    }

    pub fn no_status() -> Self {
        CloseReason::new(CloseCode::NoStatus, "")
    }

    pub fn abnormal(reason: impl Into<String>) -> Self {
        CloseReason::new(CloseCode::Abnormal, reason)
    }

    pub fn is_normal(&self) -> bool {
        matches!(self.code, CloseCode::Normal | CloseCode::NoStatus)
    }

    /// Parse the payload of a received close frame.
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        match payload {
            [] => Ok(CloseReason::no_status()),
            [_] => Err(ProtocolError::InvalidClosePayload),
            [code_high, code_low, reason @ ..] => {
                let code = u16::from_be_bytes([*code_high, *code_low]);
                if !CloseCode::is_valid_on_wire(code) {
                    return Err(ProtocolError::InvalidCloseCode(code));
                }
                let reason = std::str::from_utf8(reason).map_err(|_| ProtocolError::InvalidUtf8)?;
                Ok(CloseReason::new(code.into(), reason))
            }
        }
    }

    /// The close frame payload for this reason. `NoStatus` is an empty payload.
    ///
    /// Reasons longer than [`MAX_REASON_LEN`] are cut at a character boundary.
    pub fn to_payload(&self) -> Bytes {
        if self.code == CloseCode::NoStatus {
            return Bytes::new();
        }

        let mut end = self.reason.len().min(MAX_REASON_LEN);
        while !self.reason.is_char_boundary(end) {
            end -= 1;
        }

        let mut payload = BytesMut::with_capacity(2 + end);
        payload.put_u16(self.code.into());
        payload.put_slice(&self.reason.as_bytes()[..end]);
        payload.freeze()
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code: u16 = self.code.into();
        if self.reason.is_empty() {
            write!(f, "{}", code)
        } else {
            write!(f, "{} ({})", code, self.reason)
        }
    }
}
