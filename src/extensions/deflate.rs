//! Per-message DEFLATE extension (RFC 7692).

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use log::*;

use crate::extensions::{Extension, ExtensionError, Rsv};
use crate::protocol::frame::coding::{Data, OpCode};

/// The WebSocket extension identifier as per the IANA registry.
const EXT_IDENT: &str = "permessage-deflate";

/// The DEFLATE block trailer stripped from outbound messages and
/// re-appended to inbound ones before decompression.
const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// The minimum LZ77 sliding window size expressible on the wire.
const LZ77_MIN_WINDOW_BITS: u8 = 9;

/// The maximum LZ77 sliding window size. Absence of a window parameter
/// means the peer may use the full 32,768-byte window. RFC 7692 7.1.2.1.
const LZ77_MAX_WINDOW_BITS: u8 = 15;

/// A permessage-deflate configuration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DeflateConfig {
    /// Ask the server to reset its LZ77 window between messages
    /// (RFC 7692 7.1.1.1).
    pub server_no_context_takeover: bool,
    /// Reset the local compressor between messages, and tell the peer so.
    pub client_no_context_takeover: bool,
    /// The server's LZ77 sliding window size. Must be in 9..=15.
    pub server_max_window_bits: u8,
    /// The client's LZ77 sliding window size. Must be in 9..=15.
    pub client_max_window_bits: u8,
    /// The compression level applied to outbound messages.
    pub compression_level: Compression,
}

impl Default for DeflateConfig {
    fn default() -> Self {
        DeflateConfig {
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            server_max_window_bits: LZ77_MAX_WINDOW_BITS,
            client_max_window_bits: LZ77_MAX_WINDOW_BITS,
            compression_level: Compression::best(),
        }
    }
}

/// The parameter set both ends settled on.
#[derive(Debug, Clone, Copy)]
struct Agreed {
    compress_window: u8,
    decompress_window: u8,
    compress_reset: bool,
    decompress_reset: bool,
}

/// The per-message DEFLATE extension.
///
/// Construct with a [`DeflateConfig`] and install on a connection; the
/// handshake negotiates the parameters. For a transport whose handshake
/// happened elsewhere (RFC 8441), drive [`accept`](Extension::accept) or
/// [`finalize`](Extension::finalize) with the agreed header value before
/// constructing the connection.
#[derive(Debug)]
pub struct PerMessageDeflate {
    config: DeflateConfig,
    agreed: Option<Agreed>,
    deflator: Option<Deflator>,
    inflator: Option<Inflator>,
    /// Whether the message currently being received is compressed.
    inbound_compressed: Option<bool>,
}

impl PerMessageDeflate {
    /// Creates the extension with the given configuration.
    ///
    /// # Panics
    ///
    /// Panics if a window size is outside 9..=15.
    pub fn new(config: DeflateConfig) -> PerMessageDeflate {
        assert!(
            (LZ77_MIN_WINDOW_BITS..=LZ77_MAX_WINDOW_BITS).contains(&config.server_max_window_bits),
            "server_max_window_bits must be in range 9..=15"
        );
        assert!(
            (LZ77_MIN_WINDOW_BITS..=LZ77_MAX_WINDOW_BITS).contains(&config.client_max_window_bits),
            "client_max_window_bits must be in range 9..=15"
        );
        PerMessageDeflate {
            config,
            agreed: None,
            deflator: None,
            inflator: None,
            inbound_compressed: None,
        }
    }

    fn enable(&mut self, agreed: Agreed) {
        debug!(
            "permessage-deflate negotiated: compress window {}, decompress window {}, \
             compress reset {}, decompress reset {}",
            agreed.compress_window,
            agreed.decompress_window,
            agreed.compress_reset,
            agreed.decompress_reset
        );
        self.deflator = Some(Deflator::new(self.config.compression_level, agreed.compress_window));
        self.inflator = Some(Inflator::new(agreed.decompress_window));
        self.agreed = Some(agreed);
    }
}

impl Default for PerMessageDeflate {
    fn default() -> Self {
        PerMessageDeflate::new(DeflateConfig::default())
    }
}

impl Extension for PerMessageDeflate {
    fn name(&self) -> &'static str {
        EXT_IDENT
    }

    fn enabled(&self) -> bool {
        self.agreed.is_some()
    }

    fn reserved_bits(&self) -> Rsv {
        Rsv::RSV1
    }

    fn offer(&self) -> Option<String> {
        let mut offer = String::from(EXT_IDENT);
        if self.config.server_no_context_takeover {
            offer.push_str("; server_no_context_takeover");
        }
        if self.config.client_no_context_takeover {
            offer.push_str("; client_no_context_takeover");
        }
        if self.config.server_max_window_bits < LZ77_MAX_WINDOW_BITS {
            offer.push_str(&format!(
                "; server_max_window_bits={}",
                self.config.server_max_window_bits
            ));
        }
        offer.push_str(&format!(
            "; client_max_window_bits={}",
            self.config.client_max_window_bits
        ));
        Some(offer)
    }

    fn accept(&mut self, offer: &str) -> Option<String> {
        let offered = match OfferedParams::parse(offer) {
            Ok(offered) => offered,
            Err(err) => {
                debug!("declining permessage-deflate offer {offer:?}: {err}");
                return None;
            }
        };

        let mut response = String::from(EXT_IDENT);

        // The local compressor; the client caps it when its offer carries
        // server_max_window_bits, and the chosen value must be echoed.
        let compress_window = match offered.server_max_window_bits {
            Some(bits) => {
                let window = bits.min(self.config.server_max_window_bits);
                response.push_str(&format!("; server_max_window_bits={window}"));
                window
            }
            None => self.config.server_max_window_bits,
        };

        // The client's compressor, which the local decompressor must match.
        // A bare flag lets the server pick, but the pick must be sent.
        let decompress_window = match offered.client_max_window_bits {
            Some(Some(bits)) => {
                let window = bits.min(self.config.client_max_window_bits);
                response.push_str(&format!("; client_max_window_bits={window}"));
                window
            }
            Some(None) => {
                let window = self.config.client_max_window_bits;
                response.push_str(&format!("; client_max_window_bits={window}"));
                window
            }
            None => LZ77_MAX_WINDOW_BITS,
        };

        let compress_reset =
            offered.server_no_context_takeover || self.config.server_no_context_takeover;
        if compress_reset {
            response.push_str("; server_no_context_takeover");
        }
        let decompress_reset =
            offered.client_no_context_takeover || self.config.client_no_context_takeover;
        if decompress_reset {
            response.push_str("; client_no_context_takeover");
        }

        self.enable(Agreed { compress_window, decompress_window, compress_reset, decompress_reset });
        Some(response)
    }

    fn finalize(&mut self, params: &str) -> Result<(), ExtensionError> {
        let accepted = OfferedParams::parse(params)?;

        let compress_window = match accepted.client_max_window_bits {
            Some(Some(bits)) => {
                if bits > self.config.client_max_window_bits {
                    return Err(ExtensionError::Negotiation(format!(
                        "server demanded client window {bits}, larger than the offered {}",
                        self.config.client_max_window_bits
                    )));
                }
                bits
            }
            Some(None) => {
                return Err(ExtensionError::Negotiation(
                    "client_max_window_bits in a response requires a value".into(),
                ))
            }
            None => self.config.client_max_window_bits,
        };
        let decompress_window = accepted.server_max_window_bits.unwrap_or(LZ77_MAX_WINDOW_BITS);

        self.enable(Agreed {
            compress_window,
            decompress_window,
            // Voluntary extra resets of the local compressor are always safe.
            compress_reset: accepted.client_no_context_takeover
                || self.config.client_no_context_takeover,
            // server_no_context_takeover in the offer is a request the
            // server may decline by not echoing it; the decompressor may
            // only reset when the response carries the parameter.
            decompress_reset: accepted.server_no_context_takeover,
        });
        Ok(())
    }

    fn frame_inbound_header(
        &mut self,
        opcode: OpCode,
        rsv: Rsv,
        _fin: bool,
        _payload_length: u64,
    ) -> Result<Rsv, ExtensionError> {
        if !self.enabled() {
            return Ok(Rsv::NONE);
        }
        match opcode {
            OpCode::Control(_) => Ok(Rsv::NONE),
            OpCode::Data(Data::Continue) => {
                if rsv.rsv1 {
                    Err(ExtensionError::Protocol("RSV1 set on a continuation frame".into()))
                } else {
                    Ok(Rsv::NONE)
                }
            }
            OpCode::Data(_) => {
                // The compressed marker lives on the first data frame only.
                self.inbound_compressed = Some(rsv.rsv1);
                Ok(if rsv.rsv1 { Rsv::RSV1 } else { Rsv::NONE })
            }
        }
    }

    fn frame_inbound_payload_data(&mut self, data: Vec<u8>) -> Result<Vec<u8>, ExtensionError> {
        if self.inbound_compressed != Some(true) {
            return Ok(data);
        }
        let inflator = self.inflator.as_mut().expect("Bug: deflate enabled without an inflator");
        let mut output = Vec::with_capacity(data.len().saturating_mul(2).max(64));
        inflator.process(&data, &mut output)?;
        Ok(output)
    }

    fn frame_inbound_complete(&mut self, fin: bool) -> Result<Vec<u8>, ExtensionError> {
        if self.inbound_compressed != Some(true) {
            if fin {
                self.inbound_compressed = None;
            }
            return Ok(Vec::new());
        }
        if !fin {
            return Ok(Vec::new());
        }

        let decompress_reset =
            self.agreed.map(|agreed| agreed.decompress_reset).unwrap_or(false);
        let inflator = self.inflator.as_mut().expect("Bug: deflate enabled without an inflator");
        let mut output = Vec::with_capacity(64);
        inflator.process(&DEFLATE_TRAILER, &mut output)?;
        if decompress_reset {
            inflator.reset();
        }
        self.inbound_compressed = None;
        Ok(output)
    }

    fn frame_outbound(
        &mut self,
        opcode: OpCode,
        rsv: Rsv,
        data: Vec<u8>,
        fin: bool,
    ) -> Result<(Rsv, Vec<u8>), ExtensionError> {
        if !self.enabled() {
            return Ok((rsv, data));
        }
        let op = match opcode {
            OpCode::Data(op) => op,
            OpCode::Control(_) => return Ok((rsv, data)),
        };

        let compress_reset = self.agreed.map(|agreed| agreed.compress_reset).unwrap_or(false);
        let deflator = self.deflator.as_mut().expect("Bug: deflate enabled without a deflator");
        let mut output = Vec::with_capacity(data.len() / 2 + 16);
        deflator.process(&data, &mut output, FlushCompress::None)?;
        if fin {
            deflator.process(&[], &mut output, FlushCompress::Sync)?;
            debug_assert!(output.ends_with(&DEFLATE_TRAILER));
            output.truncate(output.len().saturating_sub(DEFLATE_TRAILER.len()));
            if compress_reset {
                deflator.reset();
            }
        }

        let rsv = match op {
            // The marker belongs to the message's first frame.
            Data::Continue => rsv,
            _ => rsv.union(Rsv::RSV1),
        };
        Ok((rsv, output))
    }
}

/// Parsed `permessage-deflate` parameters from one header entry.
#[derive(Debug, Default)]
struct OfferedParams {
    server_no_context_takeover: bool,
    client_no_context_takeover: bool,
    server_max_window_bits: Option<u8>,
    /// `None` absent, `Some(None)` a bare flag, `Some(Some(n))` a value.
    client_max_window_bits: Option<Option<u8>>,
}

impl OfferedParams {
    fn parse(value: &str) -> Result<OfferedParams, ExtensionError> {
        let mut parts = value.split(';').map(str::trim);
        if parts.next() != Some(EXT_IDENT) {
            return Err(ExtensionError::Negotiation(format!(
                "not a {EXT_IDENT} entry: {value:?}"
            )));
        }

        let mut params = OfferedParams::default();
        for part in parts {
            let mut kv = part.splitn(2, '=');
            let key = kv.next().unwrap_or("").trim().to_ascii_lowercase();
            let val = kv.next().map(|v| v.trim().trim_matches('"'));
            match (key.as_str(), val) {
                ("server_no_context_takeover", None) => {
                    if params.server_no_context_takeover {
                        return Err(duplicate("server_no_context_takeover"));
                    }
                    params.server_no_context_takeover = true;
                }
                ("client_no_context_takeover", None) => {
                    if params.client_no_context_takeover {
                        return Err(duplicate("client_no_context_takeover"));
                    }
                    params.client_no_context_takeover = true;
                }
                ("server_max_window_bits", Some(val)) => {
                    if params.server_max_window_bits.is_some() {
                        return Err(duplicate("server_max_window_bits"));
                    }
                    params.server_max_window_bits = Some(parse_window_bits(val)?);
                }
                ("client_max_window_bits", val) => {
                    if params.client_max_window_bits.is_some() {
                        return Err(duplicate("client_max_window_bits"));
                    }
                    params.client_max_window_bits =
                        Some(val.map(parse_window_bits).transpose()?);
                }
                _ => {
                    return Err(ExtensionError::Negotiation(format!(
                        "unknown permessage-deflate parameter: {part:?}"
                    )))
                }
            }
        }
        Ok(params)
    }
}

fn duplicate(name: &str) -> ExtensionError {
    ExtensionError::Negotiation(format!("duplicate extension parameter: {name}"))
}

fn parse_window_bits(value: &str) -> Result<u8, ExtensionError> {
    match value.parse::<u8>() {
        Ok(bits) if (LZ77_MIN_WINDOW_BITS..=LZ77_MAX_WINDOW_BITS).contains(&bits) => Ok(bits),
        _ => Err(ExtensionError::Negotiation(format!("invalid window bits: {value:?}"))),
    }
}

#[derive(Debug)]
struct Deflator {
    compress: Compress,
}

impl Deflator {
    fn new(level: Compression, mut window_bits: u8) -> Deflator {
        // zlib rejects raw deflate with a 256-byte window, bump to 9
        // (madler/zlib deflate.c).
        if window_bits == 8 {
            window_bits = 9;
        }
        Deflator { compress: Compress::new_with_window_bits(level, false, window_bits) }
    }

    fn reset(&mut self) {
        self.compress.reset();
    }

    fn process(
        &mut self,
        input: &[u8],
        output: &mut Vec<u8>,
        flush: FlushCompress,
    ) -> Result<(), ExtensionError> {
        let mut consumed = 0;
        loop {
            output.reserve(4096);
            let spare = output.capacity() - output.len();
            let before_in = self.compress.total_in();
            let before_out = self.compress.total_out();
            let status = self
                .compress
                .compress_vec(&input[consumed..], output, flush)
                .map_err(|e| ExtensionError::Payload(e.to_string()))?;
            consumed += (self.compress.total_in() - before_in) as usize;
            let produced = (self.compress.total_out() - before_out) as usize;
            match status {
                Status::StreamEnd => return Ok(()),
                Status::Ok | Status::BufError => {
                    if consumed == input.len() && produced < spare {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[derive(Debug)]
struct Inflator {
    decompress: Decompress,
}

impl Inflator {
    fn new(mut window_bits: u8) -> Inflator {
        if window_bits == 8 {
            window_bits = 9;
        }
        Inflator { decompress: Decompress::new_with_window_bits(false, window_bits) }
    }

    fn reset(&mut self) {
        self.decompress.reset(false);
    }

    fn process(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<(), ExtensionError> {
        let mut consumed = 0;
        loop {
            output.reserve(4096);
            let spare = output.capacity() - output.len();
            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();
            let status = self
                .decompress
                .decompress_vec(&input[consumed..], output, FlushDecompress::Sync)
                .map_err(|e| ExtensionError::Payload(e.to_string()))?;
            consumed += (self.decompress.total_in() - before_in) as usize;
            let produced = (self.decompress.total_out() - before_out) as usize;
            match status {
                Status::StreamEnd => return Ok(()),
                Status::Ok | Status::BufError => {
                    if consumed == input.len() && produced < spare {
                        return Ok(());
                    }
                }
            }
        }
    }
}
