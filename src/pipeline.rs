//! Assembling discovery and propagation methods into an immutable pipeline.
//!
//! A [`Pipeline`] is built once per filter chain, either declaratively with
//! [`Pipeline::from_config`] or method by method with [`Pipeline::builder`].
//! After construction it never changes, so it can be shared by reference
//! across every request processed on the chain without locking.

use http::{Extensions, HeaderMap};
use thiserror::Error;

use crate::discovery::{BaggageDiscovery, DiscoveryMethod, ExchangeDiscovery};
use crate::propagation::{
    BaggagePropagation, ExchangePropagation, InvalidInstanceId, PropagationMethod,
    WorkloadIdentity,
};
use crate::state::{Direction, PeerState, SharingPolicy};

/// Discovery strategies recognized by [`Pipeline::from_config`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DiscoveryConfig {
    /// Read the metadata exchange header pair.
    MetadataExchange,

    /// Read the identity member of the `baggage` header.
    Baggage,
}

/// Propagation strategies recognized by [`Pipeline::from_config`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PropagationConfig {
    /// Write the metadata exchange header pair.
    MetadataExchange,

    /// Write the identity member of the `baggage` header.
    Baggage,
}

/// Declarative description of one pipeline.
///
/// Each sequence is applied in order; configuration order is the only
/// precedence signal between methods.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    /// Whether a discovered identity may be reused for requests multiplexed
    /// onto a pooled upstream connection.
    pub shared_with_upstream: bool,

    /// Discovery methods run against request headers.
    pub downstream_discovery: Vec<DiscoveryConfig>,

    /// Discovery methods run against response headers.
    pub upstream_discovery: Vec<DiscoveryConfig>,

    /// Propagation methods run against response headers.
    pub downstream_propagation: Vec<PropagationConfig>,

    /// Propagation methods run against request headers.
    pub upstream_propagation: Vec<PropagationConfig>,
}

/// Error building a [`Pipeline`].
///
/// Construction is the only fallible stage of the exchange: once a pipeline
/// exists, discovery and propagation never return errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PipelineError {
    /// A propagation method could not be built from the workload identity.
    #[error(transparent)]
    Propagation(#[from] InvalidInstanceId),
}

/// An immutable, ordered assembly of discovery and propagation methods.
#[derive(Debug)]
pub struct Pipeline {
    sharing: SharingPolicy,
    downstream_discovery: Vec<Box<dyn DiscoveryMethod>>,
    upstream_discovery: Vec<Box<dyn DiscoveryMethod>>,
    downstream_propagation: Vec<Box<dyn PropagationMethod>>,
    upstream_propagation: Vec<Box<dyn PropagationMethod>>,
}

impl Pipeline {
    /// Start assembling a pipeline from method objects.
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Build a pipeline from a validated configuration.
    ///
    /// `workload` is queried here, once, for the propagation methods that
    /// carry the local identity; it is never consulted again.
    pub fn from_config(
        config: &PipelineConfig,
        workload: &dyn WorkloadIdentity,
    ) -> Result<Self, PipelineError> {
        Ok(Self {
            sharing: if config.shared_with_upstream {
                SharingPolicy::SharedOnce
            } else {
                SharingPolicy::Unshared
            },
            downstream_discovery: config
                .downstream_discovery
                .iter()
                .map(Self::discovery)
                .collect(),
            upstream_discovery: config
                .upstream_discovery
                .iter()
                .map(Self::discovery)
                .collect(),
            downstream_propagation: config
                .downstream_propagation
                .iter()
                .map(|method| Self::propagation(method, workload))
                .collect::<Result<_, _>>()?,
            upstream_propagation: config
                .upstream_propagation
                .iter()
                .map(|method| Self::propagation(method, workload))
                .collect::<Result<_, _>>()?,
        })
    }

    fn discovery(config: &DiscoveryConfig) -> Box<dyn DiscoveryMethod> {
        match config {
            DiscoveryConfig::MetadataExchange => Box::new(ExchangeDiscovery::new()),
            DiscoveryConfig::Baggage => Box::new(BaggageDiscovery::new()),
        }
    }

    fn propagation(
        config: &PropagationConfig,
        workload: &dyn WorkloadIdentity,
    ) -> Result<Box<dyn PropagationMethod>, PipelineError> {
        Ok(match config {
            PropagationConfig::MetadataExchange => Box::new(ExchangePropagation::new(workload)?),
            PropagationConfig::Baggage => Box::new(BaggagePropagation::new(workload)),
        })
    }

    /// Run downstream discovery against request headers, recording the
    /// winning identity in `state`.
    pub fn discover_downstream(
        &self,
        context: &Extensions,
        headers: &mut HeaderMap,
        state: &mut PeerState,
    ) {
        self.discover(
            &self.downstream_discovery,
            Direction::Downstream,
            context,
            headers,
            state,
        );
    }

    /// Run upstream discovery against response headers, recording the
    /// winning identity in `state`.
    pub fn discover_upstream(
        &self,
        context: &Extensions,
        headers: &mut HeaderMap,
        state: &mut PeerState,
    ) {
        self.discover(
            &self.upstream_discovery,
            Direction::Upstream,
            context,
            headers,
            state,
        );
    }

    fn discover(
        &self,
        methods: &[Box<dyn DiscoveryMethod>],
        direction: Direction,
        context: &Extensions,
        headers: &mut HeaderMap,
        state: &mut PeerState,
    ) {
        let mut found = None;
        for method in methods {
            if found.is_none() {
                found = method.derive(context, headers);
            }

            // Losers, and methods after the winner, still clean up.
            method.remove(headers);
        }

        if let Some(info) = found {
            state.set(direction, info, self.sharing);
        }
    }

    /// Stamp identity onto response headers, in configured order.
    pub fn inject_downstream(&self, headers: &mut HeaderMap) {
        for method in &self.downstream_propagation {
            method.inject(headers);
        }
    }

    /// Stamp identity onto request headers before they continue upstream.
    pub fn inject_upstream(&self, headers: &mut HeaderMap) {
        for method in &self.upstream_propagation {
            method.inject(headers);
        }
    }

    /// The pooling annotation recorded with discovered identities.
    pub fn sharing(&self) -> SharingPolicy {
        self.sharing
    }
}

/// Assembles a [`Pipeline`] from method objects.
///
/// This is the open half of the configuration surface: anything implementing
/// [`DiscoveryMethod`] or [`PropagationMethod`] can join the ordered lists,
/// alongside the built-in strategies [`Pipeline::from_config`] knows about.
#[derive(Debug, Default)]
pub struct PipelineBuilder {
    shared_with_upstream: bool,
    downstream_discovery: Vec<Box<dyn DiscoveryMethod>>,
    upstream_discovery: Vec<Box<dyn DiscoveryMethod>>,
    downstream_propagation: Vec<Box<dyn PropagationMethod>>,
    upstream_propagation: Vec<Box<dyn PropagationMethod>>,
}

impl PipelineBuilder {
    /// Set whether discovered identities may be shared with a pooled
    /// upstream connection.
    pub fn shared_with_upstream(mut self, shared: bool) -> Self {
        self.shared_with_upstream = shared;
        self
    }

    /// Append a discovery method run against request headers.
    pub fn discover_downstream<M>(mut self, method: M) -> Self
    where
        M: DiscoveryMethod + 'static,
    {
        self.downstream_discovery.push(Box::new(method));
        self
    }

    /// Append a discovery method run against response headers.
    pub fn discover_upstream<M>(mut self, method: M) -> Self
    where
        M: DiscoveryMethod + 'static,
    {
        self.upstream_discovery.push(Box::new(method));
        self
    }

    /// Append a propagation method run against response headers.
    pub fn propagate_downstream<M>(mut self, method: M) -> Self
    where
        M: PropagationMethod + 'static,
    {
        self.downstream_propagation.push(Box::new(method));
        self
    }

    /// Append a propagation method run against request headers.
    pub fn propagate_upstream<M>(mut self, method: M) -> Self
    where
        M: PropagationMethod + 'static,
    {
        self.upstream_propagation.push(Box::new(method));
        self
    }

    /// Freeze the assembled methods into a [`Pipeline`].
    pub fn build(self) -> Pipeline {
        Pipeline {
            sharing: if self.shared_with_upstream {
                SharingPolicy::SharedOnce
            } else {
                SharingPolicy::Unshared
            },
            downstream_discovery: self.downstream_discovery,
            upstream_discovery: self.upstream_discovery,
            downstream_propagation: self.downstream_propagation,
            upstream_propagation: self.upstream_propagation,
        }
    }
}
