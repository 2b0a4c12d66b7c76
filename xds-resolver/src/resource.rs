//! The immutable route-configuration resources produced by the xDS layer.
//!
//! Values are built once per resource update and never mutated; the
//! resolver publishes them to per-call readers inside an atomically
//! replaced snapshot.

use std::collections::HashMap;

use regex::Regex;

use crate::filter::FilterConfig;
use crate::matchers::{FractionMatcher, HeaderMatcher, PathMatcher};
use crate::random::ThreadSafeRandom;

/// A routable logical origin: domain patterns plus an ordered route list.
#[derive(Debug, Clone)]
pub struct VirtualHost {
    name: String,
    domains: Vec<String>,
    routes: Vec<Route>,
    filter_config_overrides: HashMap<String, FilterConfig>,
}

impl VirtualHost {
    pub fn new(
        name: impl Into<String>,
        domains: Vec<String>,
        routes: Vec<Route>,
        filter_config_overrides: HashMap<String, FilterConfig>,
    ) -> Self {
        Self {
            name: name.into(),
            domains,
            routes,
            filter_config_overrides,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Per-filter override configs, keyed by filter instance name.
    pub fn filter_config_overrides(&self) -> &HashMap<String, FilterConfig> {
        &self.filter_config_overrides
    }
}

/// One entry of a virtual host's route table.
#[derive(Debug, Clone)]
pub struct Route {
    route_match: RouteMatch,
    action: RouteAction,
    filter_config_overrides: HashMap<String, FilterConfig>,
}

impl Route {
    pub fn new(
        route_match: RouteMatch,
        action: RouteAction,
        filter_config_overrides: HashMap<String, FilterConfig>,
    ) -> Self {
        Self {
            route_match,
            action,
            filter_config_overrides,
        }
    }

    pub fn route_match(&self) -> &RouteMatch {
        &self.route_match
    }

    pub fn action(&self) -> &RouteAction {
        &self.action
    }

    pub fn filter_config_overrides(&self) -> &HashMap<String, FilterConfig> {
        &self.filter_config_overrides
    }
}

/// The predicate side of a route.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    path: PathMatcher,
    headers: Vec<HeaderMatcher>,
    fraction: Option<FractionMatcher>,
}

impl RouteMatch {
    pub fn new(
        path: PathMatcher,
        headers: Vec<HeaderMatcher>,
        fraction: Option<FractionMatcher>,
    ) -> Self {
        Self {
            path,
            headers,
            fraction,
        }
    }

    /// Case-sensitive exact-path match with no header or fraction
    /// conditions.
    pub fn with_path_exact(path: impl Into<String>) -> Self {
        Self::new(PathMatcher::from_path(path, true), Vec::new(), None)
    }

    /// A route matches when the path matches, every header matcher
    /// matches, and the fraction (when present) admits the RPC.
    pub fn matches(
        &self,
        full_method_name: &str,
        headers: &HashMap<String, String>,
        random: &dyn ThreadSafeRandom,
    ) -> bool {
        if !self.path.matches(full_method_name) {
            return false;
        }
        for matcher in &self.headers {
            if !matcher.matches(headers.get(matcher.name()).map(String::as_str)) {
                return false;
            }
        }
        match self.fraction {
            Some(fraction) => fraction.matches(random),
            None => true,
        }
    }
}

/// Where a route sends matched RPCs.
#[derive(Debug, Clone)]
pub struct RouteAction {
    cluster: ClusterSpec,
    hash_policies: Vec<HashPolicy>,
    timeout_nanos: Option<u64>,
}

/// A single upstream cluster, or a weighted list to draw from.
#[derive(Debug, Clone)]
pub enum ClusterSpec {
    Cluster(String),
    WeightedClusters(Vec<ClusterWeight>),
}

impl RouteAction {
    pub fn for_cluster(
        cluster: impl Into<String>,
        hash_policies: Vec<HashPolicy>,
        timeout_nanos: Option<u64>,
    ) -> Self {
        Self {
            cluster: ClusterSpec::Cluster(cluster.into()),
            hash_policies,
            timeout_nanos,
        }
    }

    /// # Panics
    ///
    /// Panics when `weighted_clusters` is empty.
    pub fn for_weighted_clusters(
        weighted_clusters: Vec<ClusterWeight>,
        hash_policies: Vec<HashPolicy>,
        timeout_nanos: Option<u64>,
    ) -> Self {
        assert!(!weighted_clusters.is_empty(), "empty cluster list");
        Self {
            cluster: ClusterSpec::WeightedClusters(weighted_clusters),
            hash_policies,
            timeout_nanos,
        }
    }

    pub fn cluster_spec(&self) -> &ClusterSpec {
        &self.cluster
    }

    pub fn hash_policies(&self) -> &[HashPolicy] {
        &self.hash_policies
    }

    pub fn timeout_nanos(&self) -> Option<u64> {
        self.timeout_nanos
    }
}

/// One entry of a weighted-cluster list.
#[derive(Debug, Clone)]
pub struct ClusterWeight {
    name: String,
    weight: u32,
    filter_config_overrides: HashMap<String, FilterConfig>,
}

impl ClusterWeight {
    pub fn new(
        name: impl Into<String>,
        weight: u32,
        filter_config_overrides: HashMap<String, FilterConfig>,
    ) -> Self {
        Self {
            name: name.into(),
            weight,
            filter_config_overrides,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn filter_config_overrides(&self) -> &HashMap<String, FilterConfig> {
        &self.filter_config_overrides
    }
}

/// Input to consistent-hash load balancing, evaluated per call in policy
/// order.
#[derive(Debug, Clone)]
pub enum HashPolicy {
    /// Hash a request header, optionally rewritten via regex substitution
    /// first.
    Header {
        header_name: String,
        regex: Option<Regex>,
        regex_substitution: Option<String>,
        terminal: bool,
    },
    /// Hash the resolver's stable channel identifier.
    ChannelId { terminal: bool },
}

impl HashPolicy {
    pub fn for_header(
        terminal: bool,
        header_name: impl Into<String>,
        regex: Option<Regex>,
        regex_substitution: Option<String>,
    ) -> Self {
        Self::Header {
            header_name: header_name.into(),
            regex,
            regex_substitution,
            terminal,
        }
    }

    pub fn for_channel_id(terminal: bool) -> Self {
        Self::ChannelId { terminal }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Header { terminal, .. } => *terminal,
            Self::ChannelId { terminal } => *terminal,
        }
    }
}
