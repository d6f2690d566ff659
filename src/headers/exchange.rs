//! The metadata exchange header pair.
//!
//! A proxy announces its identity by sending the payload, base64 encoded, in
//! the [`EXCHANGE_METADATA`] header, alongside a stable instance identifier in
//! [`EXCHANGE_METADATA_ID`]. The receiving proxy decodes the payload and
//! strips both headers before the traffic continues along the chain.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use thiserror::Error;

use crate::state::PeerInfo;

/// Header carrying the base64 encoded identity payload.
pub const EXCHANGE_METADATA: http::HeaderName =
    http::HeaderName::from_static("x-envoy-peer-metadata");

/// Header identifying the workload instance that produced the payload.
pub const EXCHANGE_METADATA_ID: http::HeaderName =
    http::HeaderName::from_static("x-envoy-peer-metadata-id");

/// Error for an exchange payload that is not valid base64.
#[derive(Debug, Error)]
#[error("exchange payload is not valid base64")]
pub struct DecodeError(#[from] base64::DecodeError);

/// Encode an identity payload as an exchange header value.
pub fn encode(info: &PeerInfo) -> http::HeaderValue {
    BASE64
        .encode(info.as_bytes())
        .parse()
        .expect("base64 output is a valid header value")
}

/// Decode an exchange payload from raw header bytes.
pub fn decode_slice(value: &[u8]) -> Result<PeerInfo, DecodeError> {
    Ok(PeerInfo::new(BASE64.decode(value)?))
}

/// Decode an exchange payload header value.
pub fn decode(value: &http::HeaderValue) -> Result<PeerInfo, DecodeError> {
    decode_slice(value.as_bytes())
}
