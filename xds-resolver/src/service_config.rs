//! Generation of the service configs the resolver pushes downstream, and
//! the parser seam through which the host channel validates them.

use std::any::Any;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tonic::Status;

const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// A parsed service config. Opaque to the resolver core; the host
/// channel's parser produces it and the host channel consumes it.
pub type ParsedServiceConfig = Arc<dyn Any + Send + Sync>;

/// Parses raw service-config JSON on behalf of the host channel.
pub trait ServiceConfigParser: Send + Sync {
    fn parse_service_config(&self, raw_service_config: &Value) -> Result<ParsedServiceConfig, Status>;
}

/// Cluster-manager load-balancing config with one child policy per
/// selectable cluster.
pub(crate) fn lb_service_config<I, S>(clusters: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut child_policy = Map::new();
    for cluster in clusters {
        let cluster = cluster.as_ref();
        child_policy.insert(
            cluster.to_string(),
            json!({
                "lbPolicy": [
                    { "cds_experimental": { "cluster": cluster } }
                ]
            }),
        );
    }
    json!({
        "loadBalancingConfig": [
            { "cluster_manager_experimental": { "childPolicy": child_policy } }
        ]
    })
}

/// Method config applying `timeout_nanos` to every method.
pub(crate) fn method_timeout_service_config(timeout_nanos: u64) -> Value {
    json!({
        "methodConfig": [
            { "name": [ {} ], "timeout": format_duration_seconds(timeout_nanos) }
        ]
    })
}

pub(crate) fn empty_service_config() -> Value {
    Value::Object(Map::new())
}

/// Formats nanoseconds as `<seconds>.<fraction>s`, trimming trailing zeros
/// of the nine-digit fraction but keeping at least one digit: `"15.0s"`,
/// `"1.000000001s"`.
fn format_duration_seconds(timeout_nanos: u64) -> String {
    let seconds = timeout_nanos / NANOS_PER_SECOND;
    let nanos = timeout_nanos % NANOS_PER_SECOND;
    let fraction = format!("{nanos:09}");
    let fraction = fraction.trim_end_matches('0');
    let fraction = if fraction.is_empty() { "0" } else { fraction };
    format!("{seconds}.{fraction}s")
}
