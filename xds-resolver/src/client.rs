//! The xDS client seam: the resource updates the resolver consumes and
//! the watch/cancel surface it drives them through.

use std::sync::Arc;

use thiserror::Error;
use tonic::Status;

use crate::filter::NamedFilterConfig;
use crate::resource::VirtualHost;

/// Callbacks observing one watched resource.
///
/// Invoked from arbitrary threads; the resolver re-enters its
/// synchronization context before touching any state.
pub trait ResourceWatcher<U>: Send + Sync {
    fn on_changed(&self, update: U);
    fn on_error(&self, error: Status);
    fn on_resource_does_not_exist(&self, resource_name: &str);
}

/// A Listener resource update.
#[derive(Debug, Clone)]
pub struct LdsUpdate {
    /// HTTP max stream duration, used as the per-call timeout fallback.
    pub http_max_stream_duration_nanos: u64,
    pub route_source: RouteSource,
    /// `None` when the client runs without HTTP-filter support.
    pub filter_chain: Option<Vec<NamedFilterConfig>>,
}

impl LdsUpdate {
    pub fn for_virtual_hosts(
        http_max_stream_duration_nanos: u64,
        virtual_hosts: Vec<VirtualHost>,
        filter_chain: Option<Vec<NamedFilterConfig>>,
    ) -> Self {
        Self {
            http_max_stream_duration_nanos,
            route_source: RouteSource::InlineVirtualHosts(virtual_hosts),
            filter_chain,
        }
    }

    pub fn for_rds_name(
        http_max_stream_duration_nanos: u64,
        rds_name: impl Into<String>,
        filter_chain: Option<Vec<NamedFilterConfig>>,
    ) -> Self {
        Self {
            http_max_stream_duration_nanos,
            route_source: RouteSource::Rds(rds_name.into()),
            filter_chain,
        }
    }
}

/// Where a Listener's route table comes from.
#[derive(Debug, Clone)]
pub enum RouteSource {
    /// Virtual hosts inlined into the Listener.
    InlineVirtualHosts(Vec<VirtualHost>),
    /// Name of the RouteConfiguration resource carrying them.
    Rds(String),
}

/// A RouteConfiguration resource update.
#[derive(Debug, Clone)]
pub struct RdsUpdate {
    pub virtual_hosts: Vec<VirtualHost>,
}

/// Transport-agnostic xDS client surface. At most one LDS and one RDS
/// watch are registered by a resolver at any time.
pub trait XdsClient: Send + Sync {
    fn watch_lds_resource(&self, resource_name: &str, watcher: Arc<dyn ResourceWatcher<LdsUpdate>>);

    fn cancel_lds_resource_watch(
        &self,
        resource_name: &str,
        watcher: &Arc<dyn ResourceWatcher<LdsUpdate>>,
    );

    fn watch_rds_resource(&self, resource_name: &str, watcher: Arc<dyn ResourceWatcher<RdsUpdate>>);

    fn cancel_rds_resource_watch(
        &self,
        resource_name: &str,
        watcher: &Arc<dyn ResourceWatcher<RdsUpdate>>,
    );
}

/// Hands the resolver its xDS client when resolution starts.
pub trait XdsClientSource: Send + Sync {
    fn xds_client(&self) -> Result<Arc<dyn XdsClient>, XdsInitError>;
}

/// Failure to set up the xDS client, e.g. an unreadable bootstrap file.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct XdsInitError {
    message: String,
}

impl XdsInitError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
