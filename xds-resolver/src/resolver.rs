//! The resolver: watches the Listener resource for its authority (and the
//! RouteConfiguration resource the Listener may point at), folds updates
//! into a routing snapshot plus the cluster reference table, and pushes
//! resolution results downstream.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use tonic::{Code, Status};
use tracing::{debug, info, warn};

use crate::client::{
    LdsUpdate, RdsUpdate, ResourceWatcher, RouteSource, XdsClient, XdsClientSource,
};
use crate::cluster::ClusterRefTable;
use crate::filter::{FilterConfig, FilterRegistry, NamedFilterConfig};
use crate::matchers;
use crate::random::{SystemRandom, ThreadSafeRandom};
use crate::resource::{ClusterSpec, Route, VirtualHost};
use crate::selector::ConfigSelector;
use crate::service_config::{self, ParsedServiceConfig, ServiceConfigParser};
use crate::sync::{Scheduler, SyncContext};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// One resolution pass: the service config derived from the currently
/// selectable clusters (or, per call, the per-method config), plus the
/// selector the host channel must route every RPC through.
pub struct ResolutionResult {
    /// The parsed service config, or the parser's error.
    pub service_config: Result<ParsedServiceConfig, Status>,
    /// Absent on empty results (resource revoked, no matching virtual
    /// host); the host channel then fails calls itself.
    pub config_selector: Option<Arc<ConfigSelector>>,
}

/// Receives resolution results and transport errors downstream.
pub trait ResolverListener: Send + Sync {
    fn on_result(&self, result: ResolutionResult);
    fn on_error(&self, error: Status);
}

/// Virtual-host-level snapshot read by the config selector. Replaced
/// wholesale on every accepted resource update.
pub(crate) struct RoutingConfig {
    pub(crate) fallback_timeout_nanos: u64,
    pub(crate) routes: Vec<Route>,
    /// `None` means HTTP-filter support is disabled: always route.
    pub(crate) filter_chain: Option<Vec<NamedFilterConfig>>,
    pub(crate) virtual_host_override_config: HashMap<String, FilterConfig>,
}

impl RoutingConfig {
    pub(crate) fn empty() -> Self {
        Self {
            fallback_timeout_nanos: 0,
            routes: Vec::new(),
            filter_chain: None,
            virtual_host_override_config: HashMap::new(),
        }
    }

    pub(crate) fn ends_with_lame(&self) -> bool {
        self.filter_chain
            .as_ref()
            .is_some_and(|chain| chain.last().is_some_and(NamedFilterConfig::is_lame))
    }
}

/// State shared between the resolver, its watchers and the per-call
/// selector.
pub(crate) struct Shared {
    pub(crate) authority: String,
    pub(crate) channel_id: u64,
    pub(crate) enable_timeout: bool,
    pub(crate) service_config_parser: Arc<dyn ServiceConfigParser>,
    pub(crate) sync_context: Arc<SyncContext>,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) random: Arc<dyn ThreadSafeRandom>,
    pub(crate) filter_registry: Arc<FilterRegistry>,
    pub(crate) cluster_refs: ClusterRefTable,
    routing_config: RwLock<Arc<RoutingConfig>>,
    listener: RwLock<Option<Arc<dyn ResolverListener>>>,
    xds_client: RwLock<Option<Arc<dyn XdsClient>>>,
}

impl Shared {
    pub(crate) fn routing_snapshot(&self) -> Arc<RoutingConfig> {
        self.routing_config.read().unwrap().clone()
    }

    fn publish_routing_config(&self, config: RoutingConfig) {
        *self.routing_config.write().unwrap() = Arc::new(config);
    }

    fn xds_client(&self) -> Option<Arc<dyn XdsClient>> {
        self.xds_client.read().unwrap().clone()
    }

    fn emit_result(&self, result: ResolutionResult) {
        let listener = self.listener.read().unwrap().clone();
        if let Some(listener) = listener {
            listener.on_result(result);
        }
    }

    fn emit_error(&self, error: Status) {
        let listener = self.listener.read().unwrap().clone();
        if let Some(listener) = listener {
            listener.on_error(error);
        }
    }

    /// Regenerates the load-balancing service config from the cluster
    /// table and pushes it downstream. Runs on the synchronization
    /// context.
    pub(crate) fn update_resolution_result(&self, selector: &Arc<ConfigSelector>) {
        let raw_config = service_config::lb_service_config(self.cluster_refs.cluster_names());
        debug!(service_config = %raw_config, "generated service config");
        let parsed = self.service_config_parser.parse_service_config(&raw_config);
        self.emit_result(ResolutionResult {
            service_config: parsed,
            config_selector: Some(selector.clone()),
        });
    }
}

/// Resolves an `xds:` target: translates control-plane routing resources
/// into a service config for the host channel and a per-call
/// [`ConfigSelector`].
pub struct XdsResolver {
    shared: Arc<Shared>,
    config_selector: Arc<ConfigSelector>,
    xds_client_source: Arc<dyn XdsClientSource>,
    resolve_state: Mutex<Option<Arc<ResolveState>>>,
}

impl XdsResolver {
    /// Starts a builder for a resolver serving `authority`.
    pub fn builder(
        authority: impl Into<String>,
        service_config_parser: Arc<dyn ServiceConfigParser>,
        xds_client_source: Arc<dyn XdsClientSource>,
        scheduler: Arc<dyn Scheduler>,
    ) -> XdsResolverBuilder {
        XdsResolverBuilder {
            authority: authority.into(),
            service_config_parser,
            xds_client_source,
            scheduler,
            random: None,
            filter_registry: None,
            enable_timeout: None,
        }
    }

    pub fn authority(&self) -> &str {
        &self.shared.authority
    }

    /// Begins resolution: acquires the xDS client and subscribes to the
    /// Listener resource named by the authority. Failures to initialize
    /// xDS are reported through `listener` and leave the resolver inert.
    pub fn start(&self, listener: Arc<dyn ResolverListener>) {
        *self.shared.listener.write().unwrap() = Some(listener.clone());
        let client = match self.xds_client_source.xds_client() {
            Ok(client) => client,
            Err(error) => {
                listener.on_error(Status::new(
                    Code::Unavailable,
                    format!("Failed to initialize xDS: {error}"),
                ));
                return;
            }
        };
        *self.shared.xds_client.write().unwrap() = Some(client);
        let state = ResolveState::new(self.shared.clone(), self.config_selector.clone());
        *self.resolve_state.lock().unwrap() = Some(state.clone());
        state.start();
    }

    /// Cancels the active watches and drops any further watcher
    /// callbacks. In-flight calls keep their retained clusters.
    pub fn shutdown(&self) {
        info!(authority = %self.shared.authority, "shutting down resolver");
        let state = self.resolve_state.lock().unwrap().take();
        if let Some(state) = state {
            state.stop();
        }
    }
}

/// Builder for [`XdsResolver`].
pub struct XdsResolverBuilder {
    authority: String,
    service_config_parser: Arc<dyn ServiceConfigParser>,
    xds_client_source: Arc<dyn XdsClientSource>,
    scheduler: Arc<dyn Scheduler>,
    random: Option<Arc<dyn ThreadSafeRandom>>,
    filter_registry: Option<FilterRegistry>,
    enable_timeout: Option<bool>,
}

impl XdsResolverBuilder {
    /// Replaces the randomness source (route fractions, weighted picks,
    /// hash fallback).
    pub fn random(mut self, random: Arc<dyn ThreadSafeRandom>) -> Self {
        self.random = Some(random);
        self
    }

    /// Replaces the filter registry. The default registry carries the
    /// fault and router filters.
    pub fn filter_registry(mut self, filter_registry: FilterRegistry) -> Self {
        self.filter_registry = Some(filter_registry);
        self
    }

    /// Overrides the `GRPC_XDS_EXPERIMENTAL_ENABLE_TIMEOUT` environment
    /// switch.
    pub fn enable_timeout(mut self, enable_timeout: bool) -> Self {
        self.enable_timeout = Some(enable_timeout);
        self
    }

    pub fn build(self) -> XdsResolver {
        let random = self
            .random
            .unwrap_or_else(|| Arc::new(SystemRandom) as Arc<dyn ThreadSafeRandom>);
        let filter_registry = self
            .filter_registry
            .unwrap_or_else(|| FilterRegistry::with_default_filters(random.clone()));
        let channel_id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(Shared {
            authority: self.authority,
            channel_id,
            enable_timeout: self.enable_timeout.unwrap_or_else(timeout_enabled_from_env),
            service_config_parser: self.service_config_parser,
            sync_context: Arc::new(SyncContext::new()),
            scheduler: self.scheduler,
            random,
            filter_registry: Arc::new(filter_registry),
            cluster_refs: ClusterRefTable::new(),
            routing_config: RwLock::new(Arc::new(RoutingConfig::empty())),
            listener: RwLock::new(None),
            xds_client: RwLock::new(None),
        });
        info!(authority = %shared.authority, channel_id, "created resolver");
        let config_selector = ConfigSelector::new(shared.clone());
        XdsResolver {
            shared,
            config_selector,
            xds_client_source: self.xds_client_source,
            resolve_state: Mutex::new(None),
        }
    }
}

fn timeout_enabled_from_env() -> bool {
    match std::env::var("GRPC_XDS_EXPERIMENTAL_ENABLE_TIMEOUT") {
        Ok(value) if !value.is_empty() => value.eq_ignore_ascii_case("true"),
        _ => true,
    }
}

/// The LDS watcher and owner of the LDS/RDS state machine. All mutations
/// run on the synchronization context.
struct ResolveState {
    weak: Weak<ResolveState>,
    shared: Arc<Shared>,
    config_selector: Arc<ConfigSelector>,
    empty_service_config: Result<ParsedServiceConfig, Status>,
    state: Mutex<ResolveStateInner>,
}

#[derive(Default)]
struct ResolveStateInner {
    stopped: bool,
    /// Clusters the most recently accepted update routes to; `None` until
    /// the first accepted update (and after cleanup).
    existing_clusters: Option<HashSet<String>>,
    route_discovery_state: Option<Arc<RouteDiscoveryState>>,
}

impl ResolveState {
    fn new(shared: Arc<Shared>, config_selector: Arc<ConfigSelector>) -> Arc<Self> {
        let empty_service_config = shared
            .service_config_parser
            .parse_service_config(&service_config::empty_service_config());
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            shared,
            config_selector,
            empty_service_config,
            state: Mutex::new(ResolveStateInner::default()),
        })
    }

    fn start(&self) {
        info!(resource = %self.shared.authority, "start watching LDS resource");
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        let Some(client) = self.shared.xds_client() else {
            return;
        };
        client.watch_lds_resource(&self.shared.authority, this);
    }

    fn stop(&self) {
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        self.shared.sync_context.execute(move || {
            info!(resource = %this.shared.authority, "stop watching LDS resource");
            let mut state = this.state.lock().unwrap();
            state.stopped = true;
            this.clean_up_route_discovery_state(&mut state);
            if let Some(client) = this.shared.xds_client() {
                let watcher: Arc<dyn ResourceWatcher<LdsUpdate>> = this.clone();
                client.cancel_lds_resource_watch(&this.shared.authority, &watcher);
            }
        });
    }

    fn handle_lds_update(&self, update: LdsUpdate) {
        let mut state = self.state.lock().unwrap();
        if state.stopped {
            return;
        }
        info!(
            authority = %self.shared.authority,
            max_stream_duration_nanos = update.http_max_stream_duration_nanos,
            "received LDS resource update"
        );
        self.clean_up_route_discovery_state(&mut state);
        match update.route_source {
            RouteSource::InlineVirtualHosts(virtual_hosts) => {
                self.update_routes(
                    &mut state,
                    &virtual_hosts,
                    update.http_max_stream_duration_nanos,
                    update.filter_chain,
                );
            }
            RouteSource::Rds(rds_name) => {
                let discovery = RouteDiscoveryState::new(
                    self.weak.clone(),
                    rds_name.clone(),
                    update.http_max_stream_duration_nanos,
                    update.filter_chain,
                );
                state.route_discovery_state = Some(discovery.clone());
                info!(resource = %rds_name, "start watching RDS resource");
                if let Some(client) = self.shared.xds_client() {
                    client.watch_rds_resource(&rds_name, discovery);
                }
            }
        }
    }

    /// Folds a set of virtual hosts into the routing snapshot, the
    /// cluster table and (when the selectable-cluster set changed) a new
    /// resolution result.
    fn update_routes(
        &self,
        state: &mut ResolveStateInner,
        virtual_hosts: &[VirtualHost],
        fallback_timeout_nanos: u64,
        filter_configs: Option<Vec<NamedFilterConfig>>,
    ) {
        let Some(virtual_host) = matchers::find_virtual_host(virtual_hosts, &self.shared.authority)
        else {
            warn!(
                hostname = %self.shared.authority,
                "failed to find virtual host matching hostname"
            );
            self.clean_up_routes(state);
            return;
        };

        // A router filter is required for request routing. Routing stays
        // enabled for clients running without HTTP-filter support.
        let mut routes = virtual_host.routes().to_vec();
        let mut filter_chain = None;
        if let Some(filter_configs) = filter_configs {
            let mut chain = Vec::with_capacity(filter_configs.len() + 1);
            let mut has_router = false;
            for named_filter in filter_configs {
                let is_router = named_filter.config.is_router();
                chain.push(named_filter);
                if is_router {
                    has_router = true;
                    break;
                }
            }
            if !has_router {
                // Fail all RPCs and reclaim the references held for
                // currently selectable clusters.
                chain.push(NamedFilterConfig::lame());
                routes = Vec::new();
            }
            filter_chain = Some(chain);
        }

        let mut clusters = HashSet::new();
        for route in &routes {
            match route.action().cluster_spec() {
                ClusterSpec::Cluster(cluster) => {
                    clusters.insert(cluster.clone());
                }
                ClusterSpec::WeightedClusters(weighted) => {
                    for cluster_weight in weighted {
                        clusters.insert(cluster_weight.name().to_string());
                    }
                }
            }
        }

        let had_clusters = state.existing_clusters.is_some();
        let previous = state.existing_clusters.take().unwrap_or_default();
        let added: Vec<String> = clusters.difference(&previous).cloned().collect();
        let deleted: Vec<String> = previous.difference(&clusters).cloned().collect();
        state.existing_clusters = Some(clusters);

        let mut should_update_result = !had_clusters;
        for cluster in &added {
            if self.shared.cluster_refs.add_membership(cluster) {
                should_update_result = true;
            }
        }
        // Announce newly added clusters before they become selectable.
        if should_update_result {
            self.shared.update_resolution_result(&self.config_selector);
        }

        // Publish the new snapshot before decrementing deleted clusters:
        // any reader that observes the new routes must find every cluster
        // it can pick already present in the table.
        self.shared.publish_routing_config(RoutingConfig {
            fallback_timeout_nanos,
            routes,
            filter_chain,
            virtual_host_override_config: virtual_host.filter_config_overrides().clone(),
        });

        let mut should_update_result = false;
        for cluster in &deleted {
            if self.shared.cluster_refs.drop_membership(cluster) {
                should_update_result = true;
            }
        }
        if should_update_result {
            self.shared.update_resolution_result(&self.config_selector);
        }
    }

    /// Reverts to the empty config: reclaims membership references, swaps
    /// in the empty snapshot and emits an empty resolution result.
    fn clean_up_routes(&self, state: &mut ResolveStateInner) {
        if let Some(existing) = state.existing_clusters.take() {
            for cluster in &existing {
                self.shared.cluster_refs.drop_membership(cluster);
            }
        }
        self.shared.publish_routing_config(RoutingConfig::empty());
        self.shared.emit_result(ResolutionResult {
            service_config: self.empty_service_config.clone(),
            config_selector: None,
        });
    }

    fn clean_up_route_discovery_state(&self, state: &mut ResolveStateInner) {
        if let Some(discovery) = state.route_discovery_state.take() {
            info!(resource = %discovery.resource_name, "stop watching RDS resource");
            if let Some(client) = self.shared.xds_client() {
                let resource_name = discovery.resource_name.clone();
                let watcher: Arc<dyn ResourceWatcher<RdsUpdate>> = discovery;
                client.cancel_rds_resource_watch(&resource_name, &watcher);
            }
        }
    }
}

impl ResourceWatcher<LdsUpdate> for ResolveState {
    fn on_changed(&self, update: LdsUpdate) {
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        self.shared
            .sync_context
            .execute(move || this.handle_lds_update(update));
    }

    fn on_error(&self, error: Status) {
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        self.shared.sync_context.execute(move || {
            let state = this.state.lock().unwrap();
            if state.stopped {
                return;
            }
            drop(state);
            this.shared.emit_error(error);
        });
    }

    fn on_resource_does_not_exist(&self, resource_name: &str) {
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        let resource_name = resource_name.to_string();
        self.shared.sync_context.execute(move || {
            let mut state = this.state.lock().unwrap();
            if state.stopped {
                return;
            }
            info!(resource = %resource_name, "LDS resource unavailable");
            this.clean_up_route_discovery_state(&mut state);
            this.clean_up_routes(&mut state);
        });
    }
}

/// Discovery state for one RouteConfiguration watch. A fresh instance is
/// created for every LDS update that points at RDS; callbacks from an
/// instance that is no longer current are discarded.
struct RouteDiscoveryState {
    weak: Weak<RouteDiscoveryState>,
    resolve_state: Weak<ResolveState>,
    resource_name: String,
    http_max_stream_duration_nanos: u64,
    filter_configs: Option<Vec<NamedFilterConfig>>,
}

impl RouteDiscoveryState {
    fn new(
        resolve_state: Weak<ResolveState>,
        resource_name: String,
        http_max_stream_duration_nanos: u64,
        filter_configs: Option<Vec<NamedFilterConfig>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            resolve_state,
            resource_name,
            http_max_stream_duration_nanos,
            filter_configs,
        })
    }

    /// A callback is honored only while this instance is still the one
    /// the resolve state points at.
    fn is_current(&self, state: &ResolveStateInner) -> bool {
        state
            .route_discovery_state
            .as_ref()
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), self))
    }
}

impl ResourceWatcher<RdsUpdate> for RouteDiscoveryState {
    fn on_changed(&self, update: RdsUpdate) {
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        let Some(resolve_state) = self.resolve_state.upgrade() else {
            return;
        };
        resolve_state.shared.sync_context.execute({
            let resolve_state = resolve_state.clone();
            move || {
                let mut state = resolve_state.state.lock().unwrap();
                if !this.is_current(&state) {
                    return;
                }
                info!(resource = %this.resource_name, "received RDS resource update");
                resolve_state.update_routes(
                    &mut state,
                    &update.virtual_hosts,
                    this.http_max_stream_duration_nanos,
                    this.filter_configs.clone(),
                );
            }
        });
    }

    fn on_error(&self, error: Status) {
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        let Some(resolve_state) = self.resolve_state.upgrade() else {
            return;
        };
        resolve_state.shared.sync_context.execute({
            let resolve_state = resolve_state.clone();
            move || {
                let state = resolve_state.state.lock().unwrap();
                if !this.is_current(&state) {
                    return;
                }
                drop(state);
                resolve_state.shared.emit_error(error);
            }
        });
    }

    fn on_resource_does_not_exist(&self, resource_name: &str) {
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        let Some(resolve_state) = self.resolve_state.upgrade() else {
            return;
        };
        let resource_name = resource_name.to_string();
        resolve_state.shared.sync_context.execute({
            let resolve_state = resolve_state.clone();
            move || {
                let mut state = resolve_state.state.lock().unwrap();
                if !this.is_current(&state) {
                    return;
                }
                info!(resource = %resource_name, "RDS resource unavailable");
                resolve_state.clean_up_routes(&mut state);
            }
        });
    }
}
