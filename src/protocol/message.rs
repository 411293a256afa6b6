//! Incremental assembly of message payloads.

use crate::error::ProtocolViolation;

/// Validates and collects UTF-8 text across frame and chunk boundaries.
///
/// Wire frames may split a text message anywhere, including in the middle
/// of a multi-byte sequence; the collector holds the unfinished tail back
/// so every returned piece is complete, valid UTF-8.
#[derive(Debug, Default)]
pub(crate) struct StringCollector {
    incomplete: Option<utf8::Incomplete>,
}

impl StringCollector {
    pub fn new() -> Self {
        StringCollector { incomplete: None }
    }

    /// Decode the next payload chunk, returning the text it completes.
    pub fn push(&mut self, tail: &[u8]) -> Result<String, ProtocolViolation> {
        let mut input = tail;
        let mut output = String::with_capacity(tail.len() + 4);

        if let Some(mut incomplete) = self.incomplete.take() {
            if let Some((result, rest)) = incomplete.try_complete(input) {
                input = rest;
                match result {
                    Ok(text) => output.push_str(text),
                    Err(_) => return Err(ProtocolViolation::InvalidUtf8),
                }
            } else {
                // The whole chunk went into the unfinished sequence.
                self.incomplete = Some(incomplete);
                return Ok(output);
            }
        }

        if !input.is_empty() {
            match utf8::decode(input) {
                Ok(text) => output.push_str(text),
                Err(utf8::DecodeError::Incomplete { valid_prefix, incomplete_suffix }) => {
                    output.push_str(valid_prefix);
                    self.incomplete = Some(incomplete_suffix);
                }
                Err(utf8::DecodeError::Invalid { .. }) => {
                    return Err(ProtocolViolation::InvalidUtf8)
                }
            }
        }

        Ok(output)
    }

    /// Check that the message did not end inside a sequence.
    pub fn finish(&mut self) -> Result<(), ProtocolViolation> {
        if self.incomplete.take().is_some() {
            Err(ProtocolViolation::InvalidUtf8)
        } else {
            Ok(())
        }
    }
}
