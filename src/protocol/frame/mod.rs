//! Utilities to work with raw WebSocket frames.

pub mod coding;

#[allow(clippy::module_inception)]
mod frame;
mod mask;

pub use self::frame::{Frame, FrameHeader};

use std::io::Cursor;

use bytes::{Buf, BytesMut};
use log::*;
use rand::{rngs::StdRng, Rng, SeedableRng};

use self::mask::{apply_mask, apply_mask_offset};
use crate::error::{LocalProtocolError, ProtocolViolation};
use crate::extensions::Rsv;
use crate::protocol::Role;

/// One delivery from [`FrameDecoder`]: a whole control frame, a whole data
/// frame, or a slice of a long data frame's payload.
///
/// Control frames always arrive whole. Data frames arrive in one or more
/// chunks as their bytes become available; `chunk_start` marks the first
/// chunk of a frame and `frame_finished` the last, so a frame whose bytes
/// arrived at once sets both.
#[derive(Debug)]
pub struct FrameChunk {
    /// The frame's header.
    pub header: FrameHeader,
    /// The declared payload length of the whole frame.
    pub length: u64,
    /// The unmasked payload bytes of this chunk.
    pub payload: Vec<u8>,
    /// True on the first chunk of a frame.
    pub chunk_start: bool,
    /// True on the chunk that exhausts the frame's payload.
    pub frame_finished: bool,
}

/// Parses inbound frames from an append-only byte buffer.
#[derive(Debug)]
pub struct FrameDecoder {
    role: Role,
    /// Bytes received and not yet consumed.
    in_buffer: BytesMut,
    /// Header and progress of the frame being read.
    current: Option<PartialFrame>,
    eof: bool,
}

#[derive(Debug)]
struct PartialFrame {
    header: FrameHeader,
    length: u64,
    remaining: u64,
    /// Payload bytes already delivered, which is also the mask offset.
    consumed: usize,
    started: bool,
}

impl FrameDecoder {
    /// Create a decoder for the given role.
    ///
    /// The role fixes the masking requirement: a server requires every
    /// inbound frame to be masked, a client requires none to be.
    pub fn new(role: Role) -> Self {
        FrameDecoder { role, in_buffer: BytesMut::new(), current: None, eof: false }
    }

    /// Append bytes to the buffer, or record end-of-stream on `None`.
    pub fn receive_bytes(&mut self, data: Option<&[u8]>) -> Result<(), LocalProtocolError> {
        match data {
            Some(_) if self.eof => Err(LocalProtocolError::ReceiveAfterEof),
            Some(data) => {
                self.in_buffer.extend_from_slice(data);
                Ok(())
            }
            None => {
                self.eof = true;
                Ok(())
            }
        }
    }

    /// Whether end-of-stream was observed.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Whether unconsumed bytes remain in the buffer.
    pub fn has_buffered_data(&self) -> bool {
        !self.in_buffer.is_empty() || self.current.is_some()
    }

    /// The next parseable chunk, if any.
    ///
    /// `allowed_rsv` is the set of reserved bits the installed extensions
    /// may claim on data frames; any other set bit fails the connection.
    pub fn next_chunk(&mut self, allowed_rsv: Rsv) -> Result<Option<FrameChunk>, ProtocolViolation> {
        if self.current.is_none() {
            let parsed = {
                let mut cursor = Cursor::new(&self.in_buffer[..]);
                FrameHeader::parse(&mut cursor)?
                    .map(|(header, length)| (header, length, cursor.position() as usize))
            };
            let (header, length, header_len) = match parsed {
                Some(parsed) => parsed,
                None => return Ok(None),
            };
            self.in_buffer.advance(header_len);
            self.validate_header(&header, length, allowed_rsv)?;
            trace!("receiving frame: {} length {length}", header.opcode);
            self.current =
                Some(PartialFrame { header, length, remaining: length, consumed: 0, started: false });
        }

        let frame = self.current.as_mut().expect("Bug: no frame in progress");

        if frame.header.opcode.is_control() {
            // Control frames are delivered whole, never streamed.
            if (self.in_buffer.len() as u64) < frame.remaining {
                return Ok(None);
            }
            let mut payload = self.in_buffer.split_to(frame.remaining as usize).to_vec();
            if let Some(mask) = frame.header.mask {
                apply_mask(&mut payload, mask);
            }
            let frame = self.current.take().expect("Bug: no frame in progress");
            return Ok(Some(FrameChunk {
                header: frame.header,
                length: frame.length,
                payload,
                chunk_start: true,
                frame_finished: true,
            }));
        }

        let available = (self.in_buffer.len() as u64).min(frame.remaining) as usize;
        if available == 0 && frame.remaining > 0 {
            return Ok(None);
        }

        let mut payload = self.in_buffer.split_to(available).to_vec();
        if let Some(mask) = frame.header.mask {
            apply_mask_offset(&mut payload, mask, frame.consumed);
        }

        let chunk_start = !frame.started;
        frame.started = true;
        frame.consumed += available;
        frame.remaining -= available as u64;
        let frame_finished = frame.remaining == 0;
        let header = frame.header.clone();
        let length = frame.length;
        if frame_finished {
            self.current = None;
        }

        Ok(Some(FrameChunk { header, length, payload, chunk_start, frame_finished }))
    }

    fn validate_header(
        &self,
        header: &FrameHeader,
        length: u64,
        allowed_rsv: Rsv,
    ) -> Result<(), ProtocolViolation> {
        match self.role {
            Role::Server if header.mask.is_none() => {
                return Err(ProtocolViolation::UnmaskedFrameFromClient)
            }
            Role::Client if header.mask.is_some() => {
                return Err(ProtocolViolation::MaskedFrameFromServer)
            }
            _ => {}
        }

        if header.opcode.is_control() {
            if !header.is_final {
                return Err(ProtocolViolation::FragmentedControlFrame);
            }
            if length > 125 {
                return Err(ProtocolViolation::ControlFrameTooBig);
            }
            if header.rsv().any() {
                return Err(ProtocolViolation::NonZeroReservedBits);
            }
        } else if !allowed_rsv.contains(header.rsv()) {
            return Err(ProtocolViolation::NonZeroReservedBits);
        }

        Ok(())
    }
}

/// Serializes outbound frames, masking them for the client role.
#[derive(Debug)]
pub struct FrameEncoder {
    role: Role,
    rng: StdRng,
}

impl FrameEncoder {
    /// Create an encoder for the given role.
    pub fn new(role: Role) -> Self {
        FrameEncoder { role, rng: StdRng::from_os_rng() }
    }

    /// Create an encoder drawing masking keys from a seeded generator,
    /// for deterministic tests.
    pub fn seeded(role: Role, seed: u64) -> Self {
        FrameEncoder { role, rng: StdRng::seed_from_u64(seed) }
    }

    /// Serialize one frame, generating a fresh mask for the client role.
    pub fn encode(&mut self, mut frame: Frame, output: &mut Vec<u8>) {
        if let Role::Client = self.role {
            frame.header_mut().mask = Some(self.rng.random());
        }
        trace!("writing frame {frame}");
        output.reserve(frame.len());
        frame.format_into(output);
    }
}

#[cfg(test)]
mod tests {
    use super::coding::{Control, Data, OpCode};
    use super::*;

    fn drain(decoder: &mut FrameDecoder) -> Vec<FrameChunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = decoder.next_chunk(Rsv::NONE).unwrap() {
            chunks.push(chunk);
        }
        chunks
    }

    #[test]
    fn read_frames() {
        let raw = [
            0x82, 0x07, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x82, 0x03, 0x03, 0x02, 0x01,
        ];
        let mut decoder = FrameDecoder::new(Role::Client);
        decoder.receive_bytes(Some(&raw)).unwrap();

        let chunks = drain(&mut decoder);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].payload, vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07]);
        assert!(chunks[0].chunk_start && chunks[0].frame_finished);
        assert_eq!(chunks[1].payload, vec![0x03, 0x02, 0x01]);
    }

    #[test]
    fn streams_data_frames_in_chunks() {
        let mut decoder = FrameDecoder::new(Role::Client);
        decoder.receive_bytes(Some(&[0x82, 0x06, 0xAA, 0xBB])).unwrap();

        let first = decoder.next_chunk(Rsv::NONE).unwrap().unwrap();
        assert!(first.chunk_start);
        assert!(!first.frame_finished);
        assert_eq!(first.payload, vec![0xAA, 0xBB]);

        decoder.receive_bytes(Some(&[0xCC, 0xDD, 0xEE, 0xFF])).unwrap();
        let second = decoder.next_chunk(Rsv::NONE).unwrap().unwrap();
        assert!(!second.chunk_start);
        assert!(second.frame_finished);
        assert_eq!(second.payload, vec![0xCC, 0xDD, 0xEE, 0xFF]);
    }

    #[test]
    fn control_frames_arrive_whole() {
        let mut decoder = FrameDecoder::new(Role::Client);
        decoder.receive_bytes(Some(&[0x89, 0x02, 0x01])).unwrap();
        assert!(decoder.next_chunk(Rsv::NONE).unwrap().is_none());
        decoder.receive_bytes(Some(&[0x02])).unwrap();
        let chunk = decoder.next_chunk(Rsv::NONE).unwrap().unwrap();
        assert_eq!(chunk.header.opcode, OpCode::Control(Control::Ping));
        assert_eq!(chunk.payload, vec![0x01, 0x02]);
    }

    #[test]
    fn unmasks_streamed_payload() {
        // Masked "Hello" from the RFC, fed byte by byte.
        let raw = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        let mut decoder = FrameDecoder::new(Role::Server);
        let mut payload = Vec::new();
        for byte in raw {
            decoder.receive_bytes(Some(&[byte])).unwrap();
            while let Some(chunk) = decoder.next_chunk(Rsv::NONE).unwrap() {
                payload.extend(chunk.payload);
            }
        }
        assert_eq!(payload, b"Hello");
    }

    #[test]
    fn server_requires_masked_frames() {
        let mut decoder = FrameDecoder::new(Role::Server);
        decoder.receive_bytes(Some(&[0x81, 0x05])).unwrap();
        assert!(matches!(
            decoder.next_chunk(Rsv::NONE),
            Err(ProtocolViolation::UnmaskedFrameFromClient)
        ));
    }

    #[test]
    fn client_rejects_masked_frames() {
        let mut decoder = FrameDecoder::new(Role::Client);
        decoder.receive_bytes(Some(&[0x81, 0x85, 0x00, 0x00, 0x00, 0x00, 0x48])).unwrap();
        assert!(matches!(
            decoder.next_chunk(Rsv::NONE),
            Err(ProtocolViolation::MaskedFrameFromServer)
        ));
    }

    #[test]
    fn rejects_fragmented_control_frames() {
        let mut decoder = FrameDecoder::new(Role::Client);
        decoder.receive_bytes(Some(&[0x09, 0x00])).unwrap();
        assert!(matches!(
            decoder.next_chunk(Rsv::NONE),
            Err(ProtocolViolation::FragmentedControlFrame)
        ));
    }

    #[test]
    fn rejects_oversized_control_frames() {
        let mut decoder = FrameDecoder::new(Role::Client);
        decoder.receive_bytes(Some(&[0x88, 0x7E, 0x00, 0x7E])).unwrap();
        assert!(matches!(
            decoder.next_chunk(Rsv::NONE),
            Err(ProtocolViolation::ControlFrameTooBig)
        ));
    }

    #[test]
    fn rejects_unclaimed_rsv_bits() {
        let mut decoder = FrameDecoder::new(Role::Client);
        decoder.receive_bytes(Some(&[0xC1, 0x01, 0x48])).unwrap();
        assert!(matches!(
            decoder.next_chunk(Rsv::NONE),
            Err(ProtocolViolation::NonZeroReservedBits)
        ));

        let mut decoder = FrameDecoder::new(Role::Client);
        decoder.receive_bytes(Some(&[0xC1, 0x01, 0x48])).unwrap();
        assert!(decoder.next_chunk(Rsv::RSV1).unwrap().is_some());
    }

    #[test]
    fn receive_after_eof_fails() {
        let mut decoder = FrameDecoder::new(Role::Client);
        decoder.receive_bytes(None).unwrap();
        assert_eq!(
            decoder.receive_bytes(Some(&[0x81])),
            Err(LocalProtocolError::ReceiveAfterEof)
        );
    }

    #[test]
    fn client_encoder_masks_frames() {
        let mut encoder = FrameEncoder::seeded(Role::Client, 7);
        let mut out = Vec::new();
        encoder.encode(Frame::message(b"Hello".to_vec(), OpCode::Data(Data::Text), true), &mut out);

        assert_eq!(out[0], 0x81);
        assert_eq!(out[1], 0x80 | 5);
        let mask = [out[2], out[3], out[4], out[5]];
        let unmasked: Vec<u8> =
            out[6..].iter().enumerate().map(|(i, byte)| byte ^ mask[i & 3]).collect();
        assert_eq!(unmasked, b"Hello");
    }

    #[test]
    fn server_encoder_does_not_mask() {
        let mut encoder = FrameEncoder::new(Role::Server);
        let mut out = Vec::new();
        encoder.encode(Frame::pong(vec![]), &mut out);
        assert_eq!(out, vec![0x8A, 0x00]);
    }
}
