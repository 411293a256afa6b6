//! WebSocket protocol extensions.
//!
//! Extensions are installed at construction and hook into both the opening
//! handshake (offer/accept/finalize) and the frame pipeline. Inbound frames
//! pass through the installed extensions in order, outbound frames in
//! reverse order. The sole built-in extension is
//! [per-message DEFLATE](deflate::PerMessageDeflate).

#[cfg(feature = "deflate")]
pub mod deflate;

use std::fmt;

use thiserror::Error;

use crate::protocol::frame::coding::OpCode;

/// The three reserved bits of a frame header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rsv {
    /// RSV1, reserved by per-message compression.
    pub rsv1: bool,
    /// RSV2.
    pub rsv2: bool,
    /// RSV3.
    pub rsv3: bool,
}

impl Rsv {
    /// No bits set.
    pub const NONE: Rsv = Rsv { rsv1: false, rsv2: false, rsv3: false };

    /// Only RSV1 set.
    pub const RSV1: Rsv = Rsv { rsv1: true, rsv2: false, rsv3: false };

    /// Bitwise union.
    pub fn union(self, other: Rsv) -> Rsv {
        Rsv {
            rsv1: self.rsv1 || other.rsv1,
            rsv2: self.rsv2 || other.rsv2,
            rsv3: self.rsv3 || other.rsv3,
        }
    }

    /// Whether every bit set in `other` is also set in `self`.
    pub fn contains(self, other: Rsv) -> bool {
        (!other.rsv1 || self.rsv1) && (!other.rsv2 || self.rsv2) && (!other.rsv3 || self.rsv3)
    }

    /// Whether any bit is set.
    pub fn any(self) -> bool {
        self.rsv1 || self.rsv2 || self.rsv3
    }
}

/// Failure inside an extension hook.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtensionError {
    /// The frame layout violates the extension's framing rules (close 1002).
    #[error("{0}")]
    Protocol(String),
    /// The frame payload is unusable, e.g. fails decompression (close 1007).
    #[error("{0}")]
    Payload(String),
    /// The frame is rejected on policy grounds (close 1008).
    #[error("{0}")]
    Policy(String),
    /// Handshake-time parameter negotiation failed.
    #[error("{0}")]
    Negotiation(String),
}

impl From<ExtensionError> for crate::error::ProtocolViolation {
    fn from(err: ExtensionError) -> Self {
        use crate::error::ProtocolViolation;
        match err {
            ExtensionError::Protocol(msg) => ProtocolViolation::ExtensionViolation(msg),
            ExtensionError::Payload(msg) => ProtocolViolation::InvalidCompressedData(msg),
            ExtensionError::Policy(msg) => ProtocolViolation::PolicyViolation(msg),
            ExtensionError::Negotiation(msg) => ProtocolViolation::ExtensionNegotiation(msg),
        }
    }
}

/// The capability contract a protocol extension implements.
///
/// `offer`, `accept` and `finalize` drive the `Sec-WebSocket-Extensions`
/// negotiation; the `frame_*` hooks transform frames once the extension is
/// [`enabled`](Extension::enabled). All header values passed across this
/// boundary are single extension entries (`name[; param[=value]]*`),
/// never comma-joined lists.
pub trait Extension: fmt::Debug {
    /// The extension's registered name.
    fn name(&self) -> &'static str;

    /// Whether negotiation succeeded and the frame hooks take part in the
    /// pipeline.
    fn enabled(&self) -> bool;

    /// The RSV bits this extension may legitimately claim once enabled.
    fn reserved_bits(&self) -> Rsv;

    /// Client side: the offer to place in `Sec-WebSocket-Extensions`.
    fn offer(&self) -> Option<String>;

    /// Server side: accept or decline a single offer carrying this
    /// extension's name, returning the value to echo in the response.
    /// Declining one offer is not an error; the peer may have sent several.
    fn accept(&mut self, offer: &str) -> Option<String>;

    /// Client side: apply the parameters the server accepted with.
    fn finalize(&mut self, params: &str) -> Result<(), ExtensionError>;

    /// Inspect an inbound frame header, returning the RSV bits claimed for
    /// this frame.
    fn frame_inbound_header(
        &mut self,
        opcode: OpCode,
        rsv: Rsv,
        fin: bool,
        payload_length: u64,
    ) -> Result<Rsv, ExtensionError>;

    /// Transform a chunk of inbound frame payload.
    fn frame_inbound_payload_data(&mut self, data: Vec<u8>) -> Result<Vec<u8>, ExtensionError>;

    /// Note the end of an inbound frame; `fin` marks the end of the
    /// message. Returns any payload completed by the frame boundary.
    fn frame_inbound_complete(&mut self, fin: bool) -> Result<Vec<u8>, ExtensionError>;

    /// Transform an outbound frame before encoding.
    fn frame_outbound(
        &mut self,
        opcode: OpCode,
        rsv: Rsv,
        data: Vec<u8>,
        fin: bool,
    ) -> Result<(Rsv, Vec<u8>), ExtensionError>;
}

#[cfg(test)]
mod tests {
    use super::Rsv;

    #[test]
    fn rsv_algebra() {
        assert!(Rsv::RSV1.contains(Rsv::NONE));
        assert!(Rsv::RSV1.contains(Rsv::RSV1));
        assert!(!Rsv::NONE.contains(Rsv::RSV1));
        assert!(Rsv::NONE.union(Rsv::RSV1).any());
        assert!(!Rsv::NONE.any());
    }
}
