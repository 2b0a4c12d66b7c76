//! Client-side xDS name resolution for gRPC channels.
//!
//! An [`XdsResolver`] translates a logical `xds:` target into two outputs
//! the host channel consumes:
//!
//! - a rolling **resolution result** — a cluster-manager load-balancing
//!   service config listing the clusters RPCs may currently be routed to;
//! - a per-call **config selector** — invoked for every outgoing RPC to
//!   match a route, pick a cluster (possibly by weight), derive the
//!   consistent-hash key, and assemble the call's interceptor chain
//!   (HTTP filters such as fault injection, plus cluster tagging).
//!
//! Configuration arrives as streaming updates over two resource channels
//! of an abstract [`XdsClient`](client::XdsClient): the Listener resource
//! named by the resolver's authority, and the RouteConfiguration resource
//! a Listener may delegate its route table to.
//!
//! A cluster removed by a config update stays selectable for calls that
//! already chose it: the resolver reference-counts clusters (one count
//! for config membership, one per in-flight call) and only narrows the
//! emitted service config once the last such call finishes.
//!
//! Everything the resolver mutates is serialized on a
//! [`SyncContext`](sync::SyncContext); per-call work only reads one
//! atomic snapshot of the routing config and the per-cluster counters.

pub mod call;
pub mod client;
mod cluster;
pub mod filter;
pub mod hash;
pub mod matchers;
pub mod random;
pub mod resolver;
pub mod resource;
pub mod selector;
pub mod service_config;
pub mod sync;

pub use call::{
    combine_interceptors, intercept, CallListener, CallOptions, Channel, ClientCall,
    ClientInterceptor, ClusterSelection, MethodDescriptor, PickArgs, RpcHash,
};
pub use client::{
    LdsUpdate, RdsUpdate, ResourceWatcher, RouteSource, XdsClient, XdsClientSource, XdsInitError,
};
pub use resolver::{ResolutionResult, ResolverListener, XdsResolver, XdsResolverBuilder};
pub use selector::{ConfigSelector, RouteSelection};
pub use service_config::{ParsedServiceConfig, ServiceConfigParser};
