//! Client handshake: request emission and response verification.

use http::header;
use http::StatusCode;

use super::headers::{extension_name, header_contains_token, header_list, headers_to_pairs};
use super::ResponseHead;
use crate::error::{ProtocolViolation, RemoteProtocolError};
use crate::events::{AcceptConnection, RejectConnection, Request};
use crate::extensions::Extension;

/// Serialize the opening GET request.
///
/// The extension offers come from the installed extensions, not from the
/// event; the engine owns extension negotiation.
pub(super) fn encode_request(
    request: &Request,
    key: &str,
    extensions: &[Box<dyn Extension>],
) -> Vec<u8> {
    let mut head = format!(
        "GET {target} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: WebSocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n",
        target = request.target,
        host = request.host,
    );

    if !request.subprotocols.is_empty() {
        head.push_str(&format!(
            "Sec-WebSocket-Protocol: {}\r\n",
            request.subprotocols.join(", ")
        ));
    }

    let offers: Vec<String> = extensions.iter().filter_map(|ext| ext.offer()).collect();
    if !offers.is_empty() {
        head.push_str(&format!("Sec-WebSocket-Extensions: {}\r\n", offers.join(", ")));
    }

    for (name, value) in &request.extra_headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");
    head.into_bytes()
}

/// Verify a 101 response against RFC 6455 §4.1 and finalize extensions.
pub(super) fn verify_response(
    head: ResponseHead,
    accept_key: &str,
    offered_subprotocols: &[String],
    extensions: &mut [Box<dyn Extension>],
) -> Result<AcceptConnection, RemoteProtocolError> {
    let headers = &head.headers;

    // An |Upgrade| header field containing a value that is not an ASCII
    // case-insensitive match for "websocket" fails the connection.
    if !header_contains_token(headers, header::UPGRADE, "websocket") {
        return Err(RemoteProtocolError::without_hint(
            ProtocolViolation::MissingUpgradeWebSocketHeader,
        ));
    }

    // |Connection| must contain an "Upgrade" token; a comma list is legal.
    if !header_contains_token(headers, header::CONNECTION, "upgrade") {
        return Err(RemoteProtocolError::without_hint(
            ProtocolViolation::MissingConnectionUpgradeHeader,
        ));
    }

    let accept_matches = headers
        .get(header::SEC_WEBSOCKET_ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim() == accept_key)
        .unwrap_or(false);
    if !accept_matches {
        return Err(RemoteProtocolError::without_hint(
            ProtocolViolation::SecWebSocketAcceptKeyMismatch,
        ));
    }

    // The selected subprotocol must be one of those offered, or none.
    let subprotocol = match headers.get(header::SEC_WEBSOCKET_PROTOCOL) {
        Some(value) => {
            let value = value
                .to_str()
                .map_err(|_| {
                    RemoteProtocolError::without_hint(ProtocolViolation::MalformedHttpHeader)
                })?
                .trim()
                .to_owned();
            if !offered_subprotocols.contains(&value) {
                return Err(RemoteProtocolError::without_hint(
                    ProtocolViolation::UnofferedSubprotocol(value),
                ));
            }
            Some(value)
        }
        None => None,
    };

    // Every accepted extension must have been offered; run finalize so the
    // agreed parameters take effect.
    let mut accepted = Vec::new();
    for value in header_list(headers, header::SEC_WEBSOCKET_EXTENSIONS) {
        let name = extension_name(&value).to_owned();
        let ext = extensions
            .iter_mut()
            .find(|ext| ext.name() == name)
            .ok_or_else(|| {
                RemoteProtocolError::without_hint(ProtocolViolation::UnofferedExtension(
                    name.clone(),
                ))
            })?;
        ext.finalize(&value)
            .map_err(|err| RemoteProtocolError::without_hint(ProtocolViolation::from(err)))?;
        accepted.push(value);
    }

    let extra_headers = headers_to_pairs(
        headers,
        &[
            header::UPGRADE,
            header::CONNECTION,
            header::SEC_WEBSOCKET_ACCEPT,
            header::SEC_WEBSOCKET_PROTOCOL,
            header::SEC_WEBSOCKET_EXTENSIONS,
        ],
    )?;

    Ok(AcceptConnection { subprotocol, extensions: accepted, extra_headers })
}

/// Interpret a non-101 response head as a rejection, returning the event
/// and the body length promised by `Content-Length`, if any.
pub(super) fn reject_from_head(
    head: &ResponseHead,
) -> Result<(RejectConnection, Option<u64>), RemoteProtocolError> {
    let headers = headers_to_pairs(&head.headers, &[])?;

    let content_length = match head.headers.get(header::CONTENT_LENGTH) {
        Some(value) => Some(
            value
                .to_str()
                .ok()
                .and_then(|value| value.trim().parse::<u64>().ok())
                .ok_or_else(|| {
                    RemoteProtocolError::without_hint(ProtocolViolation::MalformedHttpHeader)
                })?,
        ),
        // Without a length the body runs until the peer closes.
        None => None,
    };
    let has_body = content_length != Some(0) && head.status != StatusCode::NOT_MODIFIED;

    Ok((
        RejectConnection { status_code: head.status.as_u16(), headers, has_body },
        content_length,
    ))
}
