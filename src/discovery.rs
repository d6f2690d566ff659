//! Discovering peer identity from inbound headers.
//!
//! Discovery methods run in configured order. The first method to derive an
//! identity determines the result for that direction, but every configured
//! method still removes the headers it owns, so nothing a method consumed
//! leaks to the next hop.

use core::fmt;

use http::{Extensions, HeaderMap};

use crate::headers::baggage;
use crate::headers::exchange;
use crate::state::PeerInfo;

/// A strategy for extracting a peer identity from a header map.
///
/// The two operations are deliberately independent: the pipeline invokes
/// `remove` on every configured method exactly once per run, whether or not
/// that method (or any method) derived an identity.
pub trait DiscoveryMethod: fmt::Debug + Send + Sync {
    /// Attempt to extract a peer identity from the headers.
    ///
    /// `context` carries request-scoped values the host placed in the
    /// request's extensions. The bundled header readers do not consult it.
    fn derive(&self, context: &Extensions, headers: &HeaderMap) -> Option<PeerInfo>;

    /// Remove the headers this method consumes.
    ///
    /// Invoked unconditionally, independent of what `derive` returned.
    fn remove(&self, headers: &mut HeaderMap);
}

/// Reads the metadata exchange header pair.
///
/// Derives the identity from the payload header; removal strips both the
/// payload and the identifier header, since both were addressed to this hop.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExchangeDiscovery;

impl ExchangeDiscovery {
    /// Create a new exchange reader.
    pub fn new() -> Self {
        Self
    }
}

impl DiscoveryMethod for ExchangeDiscovery {
    fn derive(&self, _context: &Extensions, headers: &HeaderMap) -> Option<PeerInfo> {
        let value = headers.get(exchange::EXCHANGE_METADATA)?;

        match exchange::decode(value) {
            Ok(info) if !info.is_empty() => Some(info),
            Ok(_) => None,
            Err(error) => {
                tracing::debug!(%error, "discarding undecodable peer metadata");
                None
            }
        }
    }

    fn remove(&self, headers: &mut HeaderMap) {
        headers.remove(exchange::EXCHANGE_METADATA);
        headers.remove(exchange::EXCHANGE_METADATA_ID);
    }
}

/// Reads a trusted identity member from the `baggage` header.
///
/// Removal strips only the identity member; unrelated baggage members keep
/// flowing.
#[derive(Debug, Clone)]
pub struct BaggageDiscovery {
    key: String,
}

impl BaggageDiscovery {
    /// Create a reader for the default `peer-identity` member.
    pub fn new() -> Self {
        Self::for_key(baggage::PEER_IDENTITY)
    }

    /// Create a reader for a custom member key.
    pub fn for_key(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl Default for BaggageDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryMethod for BaggageDiscovery {
    fn derive(&self, _context: &Extensions, headers: &HeaderMap) -> Option<PeerInfo> {
        let value = baggage::find_member(headers, &self.key)?;

        match exchange::decode_slice(&value) {
            Ok(info) if !info.is_empty() => Some(info),
            Ok(_) => None,
            Err(error) => {
                tracing::debug!(%error, key = %self.key, "discarding undecodable identity baggage");
                None
            }
        }
    }

    fn remove(&self, headers: &mut HeaderMap) {
        baggage::strip_member(headers, &self.key);
    }
}
