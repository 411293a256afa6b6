//! Server handshake: request validation and response emission.

use data_encoding::BASE64;
use http::header;
use http::StatusCode;

use super::headers::{extension_name, header_contains_token, header_list, headers_to_pairs};
use super::{derive_accept_key, RequestHead};
use crate::error::{LocalProtocolError, ProtocolViolation, RemoteProtocolError};
use crate::events::{AcceptConnection, Event, RejectConnection, Request};
use crate::extensions::Extension;

/// The upgrade request, validated, plus the key kept for the reply.
#[derive(Debug)]
pub(super) struct ValidatedRequest {
    pub event: Request,
    pub key: String,
}

/// Validate an upgrade request head per RFC 6455 §4.2.1.
pub(super) fn validate_request(head: RequestHead) -> Result<ValidatedRequest, RemoteProtocolError> {
    if head.method != "GET" {
        return Err(RemoteProtocolError::with_reject(ProtocolViolation::WrongHttpMethod, 400));
    }

    let headers = &head.headers;

    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_owned())
        .ok_or_else(|| {
            RemoteProtocolError::with_reject(ProtocolViolation::MissingHostHeader, 400)
        })?;

    if !header_contains_token(headers, header::UPGRADE, "websocket") {
        return Err(RemoteProtocolError::with_reject(
            ProtocolViolation::MissingUpgradeWebSocketHeader,
            400,
        ));
    }
    if !header_contains_token(headers, header::CONNECTION, "upgrade") {
        return Err(RemoteProtocolError::with_reject(
            ProtocolViolation::MissingConnectionUpgradeHeader,
            400,
        ));
    }

    match headers.get(header::SEC_WEBSOCKET_VERSION) {
        Some(value) if value.to_str().map(|value| value.trim() == "13").unwrap_or(false) => {}
        Some(_) => {
            return Err(version_mismatch(ProtocolViolation::UnsupportedSecWebSocketVersion))
        }
        None => {
            return Err(version_mismatch(ProtocolViolation::MissingSecWebSocketVersionHeader))
        }
    }

    // The key must be the base64 form of exactly 16 bytes.
    let key = headers
        .get(header::SEC_WEBSOCKET_KEY)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_owned())
        .filter(|value| {
            BASE64.decode(value.as_bytes()).map(|bytes| bytes.len() == 16).unwrap_or(false)
        })
        .ok_or_else(|| {
            RemoteProtocolError::with_reject(ProtocolViolation::InvalidSecWebSocketKey, 400)
        })?;

    let subprotocols = header_list(headers, header::SEC_WEBSOCKET_PROTOCOL);
    let extensions = header_list(headers, header::SEC_WEBSOCKET_EXTENSIONS);
    let extra_headers = headers_to_pairs(
        headers,
        &[
            header::HOST,
            header::UPGRADE,
            header::CONNECTION,
            header::SEC_WEBSOCKET_VERSION,
            header::SEC_WEBSOCKET_KEY,
            header::SEC_WEBSOCKET_PROTOCOL,
            header::SEC_WEBSOCKET_EXTENSIONS,
        ],
    )?;

    Ok(ValidatedRequest {
        event: Request { host, target: head.target, subprotocols, extensions, extra_headers },
        key,
    })
}

/// An unsupported version is answered with 426 naming the version we speak.
fn version_mismatch(violation: ProtocolViolation) -> RemoteProtocolError {
    RemoteProtocolError::with_hint(
        violation,
        Event::RejectConnection(RejectConnection {
            status_code: 426,
            headers: vec![("Sec-WebSocket-Version".to_owned(), "13".to_owned())],
            has_body: false,
        }),
    )
}

/// Serialize the 101 reply, negotiating extensions against the offers.
///
/// Extension agreement comes from each installed extension's `accept`;
/// the event's `extensions` field is treated as received-side data.
pub(super) fn encode_accept(
    key: &str,
    accept: &AcceptConnection,
    extensions: &mut [Box<dyn Extension>],
    offered: &[String],
) -> Vec<u8> {
    let mut reply = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: WebSocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n",
        derive_accept_key(key.as_bytes())
    );

    if let Some(protocol) = &accept.subprotocol {
        reply.push_str(&format!("Sec-WebSocket-Protocol: {protocol}\r\n"));
    }

    let mut agreed = Vec::new();
    for ext in extensions.iter_mut() {
        // The client may repeat an extension with different parameters;
        // the first acceptable offer wins.
        let name = ext.name();
        let matching_offers: Vec<&String> =
            offered.iter().filter(|offer| extension_name(offer) == name).collect();
        for offer in matching_offers {
            if let Some(response) = ext.accept(offer) {
                agreed.push(response);
                break;
            }
        }
    }
    if !agreed.is_empty() {
        reply.push_str(&format!("Sec-WebSocket-Extensions: {}\r\n", agreed.join(", ")));
    }

    for (name, value) in &accept.extra_headers {
        reply.push_str(&format!("{name}: {value}\r\n"));
    }
    reply.push_str("\r\n");
    reply.into_bytes()
}

/// Serialize a rejection head with the caller's status and headers.
pub(super) fn encode_reject(reject: &RejectConnection) -> Result<Vec<u8>, LocalProtocolError> {
    let status = StatusCode::from_u16(reject.status_code)
        .map_err(|_| LocalProtocolError::MalformedEvent("status_code"))?;

    let mut reply = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown")
    );
    for (name, value) in &reject.headers {
        reply.push_str(&format!("{name}: {value}\r\n"));
    }
    reply.push_str("\r\n");
    Ok(reply.into_bytes())
}
