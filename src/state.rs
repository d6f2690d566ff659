//! Per-request peer identity state.
//!
//! Discovery writes into a [`PeerState`]; the host proxy reads the results
//! back out through the [`DownstreamPeer`] and [`UpstreamPeer`] extension
//! values. The state is owned by a single in-flight request and is destroyed
//! with it.

use core::fmt;

use bytes::Bytes;

/// An opaque identity payload describing a calling or called workload.
///
/// The byte-level encoding is produced and consumed by the discovery and
/// propagation strategies which carry it; this crate never interprets it.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PeerInfo(Bytes);

impl PeerInfo {
    /// Create a peer identity from its encoded payload.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self(payload.into())
    }

    /// The encoded payload.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume the identity, returning the payload.
    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    /// Whether the payload is empty.
    ///
    /// An empty payload carries no identity and is treated as absence.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerInfo")
            .field("len", &self.0.len())
            .finish()
    }
}

impl From<Bytes> for PeerInfo {
    fn from(payload: Bytes) -> Self {
        Self(payload)
    }
}

impl From<Vec<u8>> for PeerInfo {
    fn from(payload: Vec<u8>) -> Self {
        Self(payload.into())
    }
}

/// The direction a peer identity was discovered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// The peer that called this proxy.
    Downstream,

    /// The peer this proxy is calling.
    Upstream,
}

/// Whether a discovered identity may be reused for other requests multiplexed
/// onto the same pooled upstream connection.
///
/// This crate only records the annotation; enforcement belongs to the host
/// runtime's connection pooling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SharingPolicy {
    /// The identity applies to this request only.
    #[default]
    Unshared,

    /// The identity may be shared once with the upstream connection.
    SharedOnce,
}

/// Request-scoped store for discovered peer identities.
///
/// Holds one slot per [`Direction`]. The first write to a slot wins; later
/// writes are ignored, matching the ordered-discovery contract where the
/// first deriving method determines the result.
#[derive(Debug, Default, Clone)]
pub struct PeerState {
    downstream: Option<(PeerInfo, SharingPolicy)>,
    upstream: Option<(PeerInfo, SharingPolicy)>,
}

impl PeerState {
    /// Create an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, direction: Direction) -> &Option<(PeerInfo, SharingPolicy)> {
        match direction {
            Direction::Downstream => &self.downstream,
            Direction::Upstream => &self.upstream,
        }
    }

    /// Record a discovered identity with its pooling annotation.
    ///
    /// The first write per direction wins; subsequent writes are ignored.
    pub fn set(&mut self, direction: Direction, info: PeerInfo, sharing: SharingPolicy) {
        let slot = match direction {
            Direction::Downstream => &mut self.downstream,
            Direction::Upstream => &mut self.upstream,
        };

        if slot.is_none() {
            *slot = Some((info, sharing));
        }
    }

    /// The identity discovered for a direction, if any.
    pub fn get(&self, direction: Direction) -> Option<&PeerInfo> {
        self.slot(direction).as_ref().map(|(info, _)| info)
    }

    /// The pooling annotation recorded alongside a discovered identity.
    pub fn sharing(&self, direction: Direction) -> Option<SharingPolicy> {
        self.slot(direction).as_ref().map(|(_, sharing)| *sharing)
    }
}

/// Identity of the downstream caller, discovered from request headers.
///
/// Inserted into the request's extensions so that services behind the
/// exchange middleware can see who called.
#[derive(Debug, Clone)]
pub struct DownstreamPeer {
    info: PeerInfo,
    sharing: SharingPolicy,
}

impl DownstreamPeer {
    pub(crate) fn new(info: PeerInfo, sharing: SharingPolicy) -> Self {
        Self { info, sharing }
    }

    /// The discovered identity.
    pub fn info(&self) -> &PeerInfo {
        &self.info
    }

    /// The pooled-connection annotation for the host runtime.
    pub fn sharing(&self) -> SharingPolicy {
        self.sharing
    }
}

/// Identity of the upstream callee, discovered from response headers.
///
/// Inserted into the response's extensions.
#[derive(Debug, Clone)]
pub struct UpstreamPeer {
    info: PeerInfo,
}

impl UpstreamPeer {
    pub(crate) fn new(info: PeerInfo) -> Self {
        Self { info }
    }

    /// The discovered identity.
    pub fn info(&self) -> &PeerInfo {
        &self.info
    }
}
