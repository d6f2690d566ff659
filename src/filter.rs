//! Middleware binding the exchange to a request's lifecycle.
//!
//! One proxied request has two observable header events: request headers
//! arriving and response headers arriving. Each triggers a discovery pass
//! followed by an injection pass. Neither pass blocks, fails, or pauses the
//! request; a request with no discoverable peer flows through untouched
//! except for the headers the exchange owns.

use std::sync::Arc;

use crate::pipeline::Pipeline;
use crate::state::{Direction, DownstreamPeer, PeerState};

/// Layer applying [`PeerExchange`] to a service.
#[derive(Debug, Clone)]
pub struct PeerExchangeLayer {
    pipeline: Arc<Pipeline>,
}

impl PeerExchangeLayer {
    /// Create a layer sharing one pipeline across every request.
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

impl<S> tower::layer::Layer<S> for PeerExchangeLayer {
    type Service = PeerExchange<S>;

    fn layer(&self, inner: S) -> Self::Service {
        PeerExchange {
            inner,
            pipeline: self.pipeline.clone(),
        }
    }
}

/// Middleware running peer discovery and identity propagation on each
/// request and its response.
///
/// On the request path it discovers the downstream caller's identity and
/// stamps the local identity onto the headers continuing upstream; on the
/// response path it discovers the upstream callee's identity and stamps the
/// local identity onto the headers returning downstream. Discovered peers
/// are exposed as [`DownstreamPeer`] and [`UpstreamPeer`] extensions.
#[derive(Debug, Clone)]
pub struct PeerExchange<S> {
    inner: S,
    pipeline: Arc<Pipeline>,
}

impl<S> PeerExchange<S> {
    /// Wrap a service with the exchange.
    pub fn new(inner: S, pipeline: Arc<Pipeline>) -> Self {
        Self { inner, pipeline }
    }
}

impl<S, BIn, BOut> tower::Service<http::Request<BIn>> for PeerExchange<S>
where
    S: tower::Service<http::Request<BIn>, Response = http::Response<BOut>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = self::future::ExchangeFuture<S::Future, BOut, S::Error>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: http::Request<BIn>) -> Self::Future {
        let (mut parts, body) = request.into_parts();
        let mut state = PeerState::new();

        self.pipeline
            .discover_downstream(&parts.extensions, &mut parts.headers, &mut state);
        self.pipeline.inject_upstream(&mut parts.headers);

        if let Some(info) = state.get(Direction::Downstream) {
            let sharing = state.sharing(Direction::Downstream).unwrap_or_default();
            parts
                .extensions
                .insert(DownstreamPeer::new(info.clone(), sharing));
        }

        let request = http::Request::from_parts(parts, body);
        self::future::ExchangeFuture::new(self.inner.call(request), self.pipeline.clone(), state)
    }
}

mod future {
    use std::sync::Arc;
    use std::task::ready;

    use pin_project_lite::pin_project;

    use crate::pipeline::Pipeline;
    use crate::state::{Direction, PeerState, UpstreamPeer};

    pin_project! {
        /// Applies the response half of the exchange once headers arrive.
        #[derive(Debug)]
        pub struct ExchangeFuture<F, BOut, E> {
            #[pin]
            inner: F,
            pipeline: Arc<Pipeline>,
            state: PeerState,
            marker: std::marker::PhantomData<fn() -> Result<BOut, E>>,
        }
    }

    impl<F, BOut, E> ExchangeFuture<F, BOut, E> {
        pub(super) fn new(inner: F, pipeline: Arc<Pipeline>, state: PeerState) -> Self {
            Self {
                inner,
                pipeline,
                state,
                marker: std::marker::PhantomData,
            }
        }
    }

    impl<F, BOut, E> std::future::Future for ExchangeFuture<F, BOut, E>
    where
        F: std::future::Future<Output = Result<http::Response<BOut>, E>>,
    {
        type Output = Result<http::Response<BOut>, E>;

        fn poll(
            self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Self::Output> {
            let this = self.project();
            let result = ready!(this.inner.poll(cx));

            std::task::Poll::Ready(result.map(|response| {
                let (mut parts, body) = response.into_parts();

                this.pipeline
                    .discover_upstream(&parts.extensions, &mut parts.headers, this.state);
                this.pipeline.inject_downstream(&mut parts.headers);

                if let Some(info) = this.state.get(Direction::Upstream) {
                    parts.extensions.insert(UpstreamPeer::new(info.clone()));
                }

                http::Response::from_parts(parts, body)
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use bytes::Bytes;
    use tower::{Layer as _, ServiceExt as _};

    use super::*;
    use crate::discovery::ExchangeDiscovery;
    use crate::headers::exchange;
    use crate::pipeline::{DiscoveryConfig, PipelineConfig, PropagationConfig};
    use crate::propagation::WorkloadIdentity;
    use crate::state::{PeerInfo, SharingPolicy, UpstreamPeer};

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

    fn workload() -> Workload {
        Workload {
            identity: &[1, 2, 3],
            id: "sidecar-7",
        }
    }

    #[tokio::test]
    async fn discovers_downstream_and_strips_headers() {
        let config = PipelineConfig {
            shared_with_upstream: true,
            downstream_discovery: vec![DiscoveryConfig::MetadataExchange],
            ..Default::default()
        };
        let pipeline = Arc::new(Pipeline::from_config(&config, &workload()).unwrap());

        let service = PeerExchangeLayer::new(pipeline).layer(tower::service_fn(
            |request: http::Request<()>| async move {
                let peer = request
                    .extensions()
                    .get::<DownstreamPeer>()
                    .expect("downstream peer was discovered");
                assert_eq!(peer.info().as_bytes(), &[1, 2, 3]);
                assert_eq!(peer.sharing(), SharingPolicy::SharedOnce);

                assert!(
                    request.headers().get(exchange::EXCHANGE_METADATA).is_none(),
                    "exchange headers must not continue upstream"
                );

                Ok::<_, Infallible>(http::Response::new(()))
            },
        ));

        let request = http::Request::builder()
            .header(exchange::EXCHANGE_METADATA, "AQID")
            .header(exchange::EXCHANGE_METADATA_ID, "caller-1")
            .body(())
            .unwrap();

        service.oneshot(request).await.unwrap();
    }

    #[tokio::test]
    async fn exchange_round_trip() {
        let sender = PipelineConfig {
            upstream_propagation: vec![PropagationConfig::MetadataExchange],
            ..Default::default()
        };
        let sender = Arc::new(Pipeline::from_config(&sender, &workload()).unwrap());

        let receiver = Arc::new(
            Pipeline::builder()
                .discover_downstream(ExchangeDiscovery::new())
                .build(),
        );

        let service = PeerExchangeLayer::new(sender).layer(tower::service_fn(
            move |request: http::Request<()>| {
                let receiver = receiver.clone();
                async move {
                    let (mut parts, _) = request.into_parts();
                    let mut state = PeerState::new();
                    receiver.discover_downstream(
                        &parts.extensions,
                        &mut parts.headers,
                        &mut state,
                    );

                    assert_eq!(
                        state.get(Direction::Downstream),
                        Some(&PeerInfo::new(&[1u8, 2, 3][..])),
                        "receiver derives exactly the sent identity"
                    );
                    assert!(
                        parts.headers.get(exchange::EXCHANGE_METADATA).is_none(),
                        "the exchange header must not travel further"
                    );

                    Ok::<_, Infallible>(http::Response::new(()))
                }
            },
        ));

        service.oneshot(http::Request::new(())).await.unwrap();
    }

    #[tokio::test]
    async fn discovers_upstream_and_injects_downstream() {
        let config = PipelineConfig {
            upstream_discovery: vec![DiscoveryConfig::MetadataExchange],
            downstream_propagation: vec![PropagationConfig::MetadataExchange],
            ..Default::default()
        };
        let pipeline = Arc::new(Pipeline::from_config(&config, &workload()).unwrap());

        let service = PeerExchangeLayer::new(pipeline).layer(tower::service_fn(
            |_: http::Request<()>| async move {
                let response = http::Response::builder()
                    .header(exchange::EXCHANGE_METADATA, "BAUG")
                    .body(())
                    .unwrap();
                Ok::<_, Infallible>(response)
            },
        ));

        let response = service.oneshot(http::Request::new(())).await.unwrap();

        let peer = response
            .extensions()
            .get::<UpstreamPeer>()
            .expect("upstream peer was discovered");
        assert_eq!(peer.info().as_bytes(), &[4, 5, 6]);

        // The callee's header was consumed; the local identity went out in
        // its place.
        assert_eq!(
            response.headers().get(exchange::EXCHANGE_METADATA).unwrap(),
            "AQID"
        );
        assert_eq!(
            response
                .headers()
                .get(exchange::EXCHANGE_METADATA_ID)
                .unwrap(),
            "sidecar-7"
        );
    }

    #[tokio::test]
    async fn absence_flows_through_silently() {
        let config = PipelineConfig {
            downstream_discovery: vec![DiscoveryConfig::MetadataExchange],
            upstream_discovery: vec![DiscoveryConfig::MetadataExchange],
            ..Default::default()
        };
        let pipeline = Arc::new(Pipeline::from_config(&config, &workload()).unwrap());

        let service = PeerExchangeLayer::new(pipeline).layer(tower::service_fn(
            |request: http::Request<()>| async move {
                assert!(request.extensions().get::<DownstreamPeer>().is_none());
                Ok::<_, Infallible>(http::Response::new(()))
            },
        ));

        let response = service.oneshot(http::Request::new(())).await.unwrap();
        assert!(response.extensions().get::<UpstreamPeer>().is_none());
        assert!(response.headers().is_empty());
    }
}
