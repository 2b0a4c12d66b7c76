//! Per-call routing: matches a route in the current snapshot, picks and
//! retains a cluster, derives the RPC hash and assembles the interceptor
//! chain that tags the call and releases the cluster when it ends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tonic::metadata::MetadataMap;
use tonic::{Code, Status};

use crate::call::{
    combine_interceptors, CallListener, CallOptions, Channel, ClientCall, ClientInterceptor,
    ClusterSelection, MethodDescriptor, PickArgs, RpcHash,
};
use crate::filter::{Filter, FilterConfig, LameFilter};
use crate::hash;
use crate::matchers::index_ascii_headers;
use crate::resolver::{RoutingConfig, Shared};
use crate::resource::{ClusterSpec, ClusterWeight, HashPolicy};

/// A successful routing decision for one RPC.
pub struct RouteSelection {
    /// Parsed per-method service config (empty unless the route carries a
    /// timeout).
    pub config: crate::service_config::ParsedServiceConfig,
    /// Combined interceptor chain the host channel must apply to the
    /// call.
    pub interceptor: Arc<dyn ClientInterceptor>,
}

impl std::fmt::Debug for RouteSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteSelection").finish_non_exhaustive()
    }
}

/// The per-call selector attached to every resolution result.
///
/// Reads one atomic snapshot of the routing config per attempt and
/// otherwise runs on the caller's thread; an attempt that loses the race
/// against cluster eviction re-reads the snapshot and retries.
pub struct ConfigSelector {
    weak: std::sync::Weak<ConfigSelector>,
    shared: Arc<Shared>,
}

struct SelectedRoute {
    route_index: usize,
    cluster: String,
    override_configs: HashMap<String, FilterConfig>,
}

impl ConfigSelector {
    pub(crate) fn new(shared: Arc<Shared>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            shared,
        })
    }

    /// Routes one RPC. Returns `UNAVAILABLE` when no route matches, or
    /// the augmented parser error when the generated method config does
    /// not parse.
    pub fn select_config(&self, args: &PickArgs<'_>) -> Result<RouteSelection, Status> {
        let ascii_headers = index_ascii_headers(args.headers);
        let path = args.method.path();

        let (routing, selected) = loop {
            let routing = self.shared.routing_snapshot();
            if routing.ends_with_lame() {
                // No router filter: skip matching entirely; the lame
                // interceptor below fails the call.
                break (routing, None);
            }
            let Some(route_index) = routing.routes.iter().position(|route| {
                route
                    .route_match()
                    .matches(&path, &ascii_headers, self.shared.random.as_ref())
            }) else {
                return Err(Status::new(
                    Code::Unavailable,
                    "Could not find xDS route matching RPC",
                ));
            };
            let route = &routing.routes[route_index];
            let mut override_configs = routing.virtual_host_override_config.clone();
            for (name, config) in route.filter_config_overrides() {
                override_configs.insert(name.clone(), config.clone());
            }
            let cluster = match route.action().cluster_spec() {
                ClusterSpec::Cluster(cluster) => cluster.clone(),
                ClusterSpec::WeightedClusters(weighted) => {
                    let picked = self.pick_weighted_cluster(weighted);
                    for (name, config) in picked.filter_config_overrides() {
                        override_configs.insert(name.clone(), config.clone());
                    }
                    picked.name().to_string()
                }
            };
            // A failed retain means the snapshot was superseded and the
            // cluster already evicted; match again against the new one.
            if self.shared.cluster_refs.retain(&cluster) {
                break (
                    routing,
                    Some(SelectedRoute {
                        route_index,
                        cluster,
                        override_configs,
                    }),
                );
            }
        };

        let mut raw_service_config = crate::service_config::empty_service_config();
        if self.shared.enable_timeout {
            let timeout_nanos = selected
                .as_ref()
                .and_then(|s| routing.routes[s.route_index].action().timeout_nanos())
                .unwrap_or(routing.fallback_timeout_nanos);
            if timeout_nanos > 0 {
                raw_service_config =
                    crate::service_config::method_timeout_service_config(timeout_nanos);
            }
        }
        let config = match self
            .shared
            .service_config_parser
            .parse_service_config(&raw_service_config)
        {
            Ok(config) => config,
            Err(error) => {
                if let Some(selected) = &selected {
                    self.release_cluster(&selected.cluster);
                }
                return Err(Status::new(
                    error.code(),
                    format!(
                        "{}\nFailed to parse service config (method config)",
                        error.message()
                    ),
                ));
            }
        };

        let Some(SelectedRoute {
            route_index,
            cluster,
            override_configs,
        }) = selected
        else {
            // Lame chain: only the filter interceptors run; every call is
            // failed by the lame one and no cluster is involved.
            let interceptors =
                self.build_filter_interceptors(&routing, &routing.virtual_host_override_config, args);
            return Ok(RouteSelection {
                config,
                interceptor: combine_interceptors(interceptors),
            });
        };

        let Some(selector) = self.weak.upgrade() else {
            return Err(Status::new(Code::Unavailable, "resolver is shut down"));
        };
        let mut interceptors = self.build_filter_interceptors(&routing, &override_configs, args);
        let rpc_hash = self.generate_hash(
            routing.routes[route_index].action().hash_policies(),
            &ascii_headers,
        );
        interceptors.push(Arc::new(ClusterSelectionInterceptor {
            selector,
            cluster,
            rpc_hash,
        }));
        Ok(RouteSelection {
            config,
            interceptor: combine_interceptors(interceptors),
        })
    }

    fn pick_weighted_cluster<'a>(&self, weighted: &'a [ClusterWeight]) -> &'a ClusterWeight {
        let total_weight: u32 = weighted.iter().map(ClusterWeight::weight).sum();
        let mut remaining = self.shared.random.next_below(total_weight);
        for cluster_weight in weighted {
            if remaining < cluster_weight.weight() {
                return cluster_weight;
            }
            remaining -= cluster_weight.weight();
        }
        // The draw is below the total, so the scan always returns above.
        &weighted[weighted.len() - 1]
    }

    fn build_filter_interceptors(
        &self,
        routing: &RoutingConfig,
        override_configs: &HashMap<String, FilterConfig>,
        args: &PickArgs<'_>,
    ) -> Vec<Arc<dyn ClientInterceptor>> {
        let mut interceptors: Vec<Arc<dyn ClientInterceptor>> = Vec::new();
        let Some(filter_chain) = &routing.filter_chain else {
            return interceptors;
        };
        for named_filter in filter_chain {
            let filter: Option<Arc<dyn Filter>> = if named_filter.is_lame() {
                Some(Arc::new(LameFilter))
            } else {
                self.shared.filter_registry.get(named_filter.config.type_url())
            };
            let Some(filter) = filter else { continue };
            let override_config = named_filter
                .name
                .as_ref()
                .and_then(|name| override_configs.get(name));
            if let Some(interceptor) = filter.build_client_interceptor(
                &named_filter.config,
                override_config,
                args,
                &self.shared.scheduler,
            ) {
                interceptors.push(interceptor);
            }
        }
        interceptors
    }

    /// Folds the route's hash policies over the indexed headers; falls
    /// back to a random hash when no policy yields one.
    fn generate_hash(&self, policies: &[HashPolicy], headers: &HashMap<String, String>) -> u64 {
        let mut rpc_hash: Option<u64> = None;
        for policy in policies {
            let new_hash = match policy {
                HashPolicy::Header {
                    header_name,
                    regex,
                    regex_substitution,
                    ..
                } => headers.get(header_name).map(|value| {
                    let value = match (regex, regex_substitution) {
                        (Some(regex), Some(substitution)) => {
                            regex.replace_all(value, substitution.as_str()).into_owned()
                        }
                        _ => value.clone(),
                    };
                    hash::hash_ascii_string(&value)
                }),
                HashPolicy::ChannelId { .. } => Some(hash::hash_long(self.shared.channel_id)),
            };
            if let Some(new_hash) = new_hash {
                // Rotating the previous value keeps duplicate policies
                // from cancelling each other out.
                let old_hash = rpc_hash.map_or(0, |h| h.rotate_left(1));
                rpc_hash = Some(old_hash ^ new_hash);
            }
            if policy.is_terminal() && rpc_hash.is_some() {
                break;
            }
        }
        rpc_hash.unwrap_or_else(|| self.shared.random.next_u64())
    }

    /// Drops a call reference; when the cluster drains to zero, schedules
    /// the removal step (which re-checks the count) and the narrower
    /// resolution result on the synchronization context.
    pub(crate) fn release_cluster(&self, cluster: &str) {
        if self.shared.cluster_refs.release(cluster) {
            let weak = self.weak.clone();
            let cluster = cluster.to_string();
            self.shared.sync_context.execute(move || {
                let Some(selector) = weak.upgrade() else {
                    return;
                };
                if selector.shared.cluster_refs.remove_if_unreferenced(&cluster) {
                    selector.shared.update_resolution_result(&selector);
                }
            });
        }
    }
}

/// Innermost interceptor of a routed call: tags the call options with the
/// chosen cluster and hash, and guarantees exactly one release of the
/// retained cluster per call.
struct ClusterSelectionInterceptor {
    selector: Arc<ConfigSelector>,
    cluster: String,
    rpc_hash: u64,
}

impl ClientInterceptor for ClusterSelectionInterceptor {
    fn intercept_call(
        &self,
        method: &MethodDescriptor,
        options: CallOptions,
        next: &Arc<dyn Channel>,
    ) -> Box<dyn ClientCall> {
        let options = options
            .with_value(ClusterSelection(self.cluster.clone()))
            .with_value(RpcHash(self.rpc_hash));
        let inner = next.new_call(method, options);
        Box::new(ClusterSelectionCall {
            inner,
            tracker: Arc::new(CallTracker {
                selector: self.selector.clone(),
                cluster: self.cluster.clone(),
                released: AtomicBool::new(false),
            }),
        })
    }
}

struct CallTracker {
    selector: Arc<ConfigSelector>,
    cluster: String,
    released: AtomicBool,
}

impl CallTracker {
    fn release_once(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.selector.release_cluster(&self.cluster);
        }
    }
}

struct ClusterSelectionCall {
    inner: Box<dyn ClientCall>,
    tracker: Arc<CallTracker>,
}

impl ClientCall for ClusterSelectionCall {
    fn start(&mut self, listener: Box<dyn CallListener>, headers: MetadataMap) {
        self.inner.start(
            Box::new(ReleasingListener {
                inner: listener,
                tracker: self.tracker.clone(),
                committed: false,
            }),
            headers,
        );
    }

    fn cancel(&mut self, message: &str) {
        self.inner.cancel(message);
    }
}

/// Releases the retained cluster on response headers (the call is then
/// committed) or, failing that, on close.
struct ReleasingListener {
    inner: Box<dyn CallListener>,
    tracker: Arc<CallTracker>,
    committed: bool,
}

impl CallListener for ReleasingListener {
    fn on_headers(&mut self, headers: MetadataMap) {
        self.committed = true;
        self.tracker.release_once();
        self.inner.on_headers(headers);
    }

    fn on_close(&mut self, status: Status, trailers: MetadataMap) {
        if !self.committed {
            self.tracker.release_once();
        }
        self.inner.on_close(status, trailers);
    }
}
