//! Propagating the local workload identity into outbound headers.
//!
//! Propagation methods compute their header values once, at pipeline
//! construction, from the [`WorkloadIdentity`] capability. Every request
//! thereafter injects the same cached values; the request path never queries
//! the workload subsystem and never consults per-request discovered state.

use core::fmt;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue};
use thiserror::Error;

use crate::headers::baggage;
use crate::headers::exchange;
use crate::state::PeerInfo;

/// Source of the local workload's identity.
///
/// Queried once per filter-chain lifetime, at pipeline construction; never
/// on the request path.
pub trait WorkloadIdentity {
    /// The local identity payload.
    ///
    /// An empty payload means the identity is unknown, and propagation
    /// methods built from it inject nothing.
    fn identity(&self) -> Bytes;

    /// A stable identifier for this workload instance, sent alongside the
    /// payload in the exchange identifier header.
    fn instance_id(&self) -> String;
}

/// A strategy for stamping identity onto an outgoing header map.
pub trait PropagationMethod: fmt::Debug + Send + Sync {
    /// Add or overwrite the headers this method owns.
    ///
    /// Injection uses replace semantics: when two configured methods write
    /// the same header, the later method's value survives.
    fn inject(&self, headers: &mut HeaderMap);
}

/// Error for a workload instance id that cannot be sent in a header.
#[derive(Debug, Error)]
#[error("workload instance id is not a valid header value")]
pub struct InvalidInstanceId(#[from] http::header::InvalidHeaderValue);

/// Writes the metadata exchange header pair.
#[derive(Debug, Clone)]
pub struct ExchangePropagation {
    cached: Option<(HeaderValue, HeaderValue)>,
}

impl ExchangePropagation {
    /// Build the writer from the local workload identity.
    ///
    /// The payload and identifier header values are computed here, once, and
    /// injected verbatim for the lifetime of the pipeline.
    pub fn new(workload: &dyn WorkloadIdentity) -> Result<Self, InvalidInstanceId> {
        let identity = workload.identity();
        if identity.is_empty() {
            return Ok(Self { cached: None });
        }

        let payload = exchange::encode(&PeerInfo::new(identity));
        let id = HeaderValue::try_from(workload.instance_id())?;

        Ok(Self {
            cached: Some((payload, id)),
        })
    }
}

impl PropagationMethod for ExchangePropagation {
    fn inject(&self, headers: &mut HeaderMap) {
        if let Some((payload, id)) = &self.cached {
            headers.insert(exchange::EXCHANGE_METADATA, payload.clone());
            headers.insert(exchange::EXCHANGE_METADATA_ID, id.clone());
        }
    }
}

/// Writes the identity as a `peer-identity` member of the `baggage` header.
#[derive(Debug, Clone)]
pub struct BaggagePropagation {
    cached: Option<HeaderValue>,
}

impl BaggagePropagation {
    /// Build the writer from the local workload identity.
    pub fn new(workload: &dyn WorkloadIdentity) -> Self {
        let identity = workload.identity();
        let cached = (!identity.is_empty()).then(|| {
            let encoded = exchange::encode(&PeerInfo::new(identity));
            baggage::member_value(baggage::PEER_IDENTITY, encoded.as_bytes().to_vec())
                .expect("a base64 payload is a valid baggage member")
        });

        Self { cached }
    }
}

impl PropagationMethod for BaggagePropagation {
    fn inject(&self, headers: &mut HeaderMap) {
        if let Some(value) = &self.cached {
            headers.insert(baggage::BAGGAGE, value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Workload {
        identity: &'static [u8],
        id: &'static str,
    }

    impl WorkloadIdentity for Workload {
        fn identity(&self) -> Bytes {
            Bytes::from_static(self.identity)
        }

        fn instance_id(&self) -> String {
            self.id.to_string()
        }
    }

    #[test]
    fn exchange_injects_cached_pair() {
        let workload = Workload {
            identity: &[1, 2, 3],
            id: "sidecar-7",
        };
        let method = ExchangePropagation::new(&workload).unwrap();

        let mut headers = HeaderMap::new();
        method.inject(&mut headers);

        assert_eq!(headers.get(exchange::EXCHANGE_METADATA).unwrap(), "AQID");
        assert_eq!(
            headers.get(exchange::EXCHANGE_METADATA_ID).unwrap(),
            "sidecar-7"
        );
    }

    #[test]
    fn exchange_injection_is_stable_across_requests() {
        let workload = Workload {
            identity: b"payload",
            id: "sidecar-7",
        };
        let method = ExchangePropagation::new(&workload).unwrap();

        let mut first = HeaderMap::new();
        let mut second = HeaderMap::new();
        method.inject(&mut first);
        method.inject(&mut second);

        assert_eq!(
            first.get(exchange::EXCHANGE_METADATA),
            second.get(exchange::EXCHANGE_METADATA)
        );
    }

    #[test]
    fn exchange_unknown_identity_injects_nothing() {
        let workload = Workload {
            identity: &[],
            id: "sidecar-7",
        };
        let method = ExchangePropagation::new(&workload).unwrap();

        let mut headers = HeaderMap::new();
        method.inject(&mut headers);

        assert!(headers.is_empty());
    }

    #[test]
    fn exchange_rejects_unsendable_instance_id() {
        let workload = Workload {
            identity: &[1],
            id: "line\nbreak",
        };

        assert!(ExchangePropagation::new(&workload).is_err());
    }

    #[test]
    fn baggage_injects_identity_member() {
        let workload = Workload {
            identity: &[1, 2, 3],
            id: "sidecar-7",
        };
        let method = BaggagePropagation::new(&workload);

        let mut headers = HeaderMap::new();
        method.inject(&mut headers);

        assert_eq!(
            headers.get(baggage::BAGGAGE).unwrap(),
            "peer-identity=AQID"
        );
    }

    #[test]
    fn baggage_replaces_existing_header() {
        let workload = Workload {
            identity: &[1, 2, 3],
            id: "sidecar-7",
        };
        let method = BaggagePropagation::new(&workload);

        let mut headers = HeaderMap::new();
        headers.insert(baggage::BAGGAGE, "stale=value".parse().unwrap());
        method.inject(&mut headers);

        assert_eq!(
            headers.get(baggage::BAGGAGE).unwrap(),
            "peer-identity=AQID"
        );
    }
}
