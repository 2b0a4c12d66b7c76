//! Client-side HTTP-filter support: the registry mapping filter type URLs
//! to implementations, and the built-in router and lame filters.

pub mod fault;

use std::collections::HashMap;
use std::sync::Arc;

use tonic::metadata::MetadataMap;
use tonic::{Code, Status};

use crate::call::{
    CallListener, CallOptions, Channel, ClientCall, ClientInterceptor, MethodDescriptor, PickArgs,
};
use crate::filter::fault::{FaultConfig, FaultFilter};
use crate::random::ThreadSafeRandom;
use crate::sync::Scheduler;

/// Type URL of the router filter, which terminates the effective chain.
pub const ROUTER_FILTER_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";

/// Type URL of the HTTP fault-injection filter.
pub const FAULT_FILTER_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.fault.v3.HTTPFault";

const LAME_FILTER_TYPE_URL: &str = "grpc.internal.terminal-filter";

/// Configuration for one filter in a chain (or an override of one).
#[derive(Debug, Clone)]
pub enum FilterConfig {
    /// Fault-injection settings.
    Fault(FaultConfig),
    /// Router marker; carries no settings.
    Router,
    /// Sentinel appended when a chain has no router; fails every call.
    Lame,
}

impl FilterConfig {
    pub fn type_url(&self) -> &'static str {
        match self {
            Self::Fault(_) => FAULT_FILTER_TYPE_URL,
            Self::Router => ROUTER_FILTER_TYPE_URL,
            Self::Lame => LAME_FILTER_TYPE_URL,
        }
    }

    pub(crate) fn is_router(&self) -> bool {
        matches!(self, Self::Router)
    }

    pub(crate) fn is_lame(&self) -> bool {
        matches!(self, Self::Lame)
    }
}

/// A filter instance name paired with its config. The name keys the
/// per-virtual-host/route/weighted-cluster override maps.
#[derive(Debug, Clone)]
pub struct NamedFilterConfig {
    /// `None` only for the internal lame sentinel.
    pub name: Option<String>,
    pub config: FilterConfig,
}

impl NamedFilterConfig {
    pub fn new(name: impl Into<String>, config: FilterConfig) -> Self {
        Self {
            name: Some(name.into()),
            config,
        }
    }

    pub(crate) fn lame() -> Self {
        Self {
            name: None,
            config: FilterConfig::Lame,
        }
    }

    pub(crate) fn is_lame(&self) -> bool {
        self.name.is_none() && self.config.is_lame()
    }
}

/// A client-side HTTP filter implementation.
pub trait Filter: Send + Sync {
    /// Type URLs of the configs this filter handles.
    fn type_urls(&self) -> &'static [&'static str];

    /// Builds the per-call interceptor for this filter, or `None` when the
    /// filter does not participate in this call. `override_config` is the
    /// merged virtual-host/route/weighted-cluster override for the
    /// filter's instance name.
    fn build_client_interceptor(
        &self,
        config: &FilterConfig,
        override_config: Option<&FilterConfig>,
        args: &PickArgs<'_>,
        scheduler: &Arc<dyn Scheduler>,
    ) -> Option<Arc<dyn ClientInterceptor>> {
        let _ = (config, override_config, args, scheduler);
        None
    }
}

/// Registry of filter implementations, keyed by config type URL.
/// Populated at resolver construction.
#[derive(Default)]
pub struct FilterRegistry {
    filters: HashMap<&'static str, Arc<dyn Filter>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry carrying the built-in filters, sharing `random` with the
    /// fault filter.
    pub fn with_default_filters(random: Arc<dyn ThreadSafeRandom>) -> Self {
        Self::new()
            .register(Arc::new(FaultFilter::new(random)))
            .register(Arc::new(RouterFilter))
    }

    /// Registers `filter` under each of its type URLs.
    pub fn register(mut self, filter: Arc<dyn Filter>) -> Self {
        for type_url in filter.type_urls() {
            self.filters.insert(type_url, filter.clone());
        }
        self
    }

    pub(crate) fn get(&self, type_url: &str) -> Option<Arc<dyn Filter>> {
        self.filters.get(type_url).cloned()
    }
}

/// The router filter. Routing itself is handled by the resolver; the
/// filter only marks where the chain ends.
pub struct RouterFilter;

impl Filter for RouterFilter {
    fn type_urls(&self) -> &'static [&'static str] {
        &[ROUTER_FILTER_TYPE_URL]
    }
}

/// Stands in for a missing router filter: every call it touches is closed
/// with `UNAVAILABLE` before it starts.
pub(crate) struct LameFilter;

impl Filter for LameFilter {
    fn type_urls(&self) -> &'static [&'static str] {
        &[LAME_FILTER_TYPE_URL]
    }

    fn build_client_interceptor(
        &self,
        _config: &FilterConfig,
        _override_config: Option<&FilterConfig>,
        _args: &PickArgs<'_>,
        _scheduler: &Arc<dyn Scheduler>,
    ) -> Option<Arc<dyn ClientInterceptor>> {
        Some(Arc::new(LameInterceptor))
    }
}

struct LameInterceptor;

impl ClientInterceptor for LameInterceptor {
    fn intercept_call(
        &self,
        _method: &MethodDescriptor,
        _options: CallOptions,
        _next: &Arc<dyn Channel>,
    ) -> Box<dyn ClientCall> {
        Box::new(FailingCall::new(Status::new(
            Code::Unavailable,
            "No router filter",
        )))
    }
}

/// A call that closes with a fixed status instead of starting.
pub(crate) struct FailingCall {
    status: Option<Status>,
    on_terminated: Option<Box<dyn FnOnce() + Send>>,
}

impl FailingCall {
    pub(crate) fn new(status: Status) -> Self {
        Self {
            status: Some(status),
            on_terminated: None,
        }
    }

    pub(crate) fn with_callback(status: Status, on_terminated: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            status: Some(status),
            on_terminated: Some(on_terminated),
        }
    }
}

impl ClientCall for FailingCall {
    fn start(&mut self, mut listener: Box<dyn CallListener>, _headers: MetadataMap) {
        if let Some(callback) = self.on_terminated.take() {
            callback();
        }
        if let Some(status) = self.status.take() {
            listener.on_close(status, MetadataMap::new());
        }
    }

    fn cancel(&mut self, _message: &str) {
        if let Some(callback) = self.on_terminated.take() {
            callback();
        }
        self.status = None;
    }
}
