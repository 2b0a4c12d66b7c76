//! The slice of the client-call surface the resolver needs: enough for
//! interceptors to adjust per-call options before a call is created and to
//! observe call lifecycle events afterwards.
//!
//! The host channel owns the real call machinery; these traits are the
//! seam it plugs the selector's combined interceptor into.

use std::sync::Arc;

use http::Extensions;
use tonic::metadata::MetadataMap;
use tonic::Status;

/// Identifies an RPC method as `"<Service>/<Method>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    full_method_name: String,
}

impl MethodDescriptor {
    pub fn new(full_method_name: impl Into<String>) -> Self {
        Self {
            full_method_name: full_method_name.into(),
        }
    }

    pub fn full_method_name(&self) -> &str {
        &self.full_method_name
    }

    /// The method as a request path, e.g. `/HelloService/hi`.
    pub(crate) fn path(&self) -> String {
        format!("/{}", self.full_method_name)
    }
}

/// Per-call options: a typed value bag in the style of request extensions.
#[derive(Debug, Default, Clone)]
pub struct CallOptions {
    values: Extensions,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value<T: Clone + Send + Sync + 'static>(mut self, value: T) -> Self {
        self.values.insert(value);
        self
    }

    pub fn get<T: Clone + Send + Sync + 'static>(&self) -> Option<&T> {
        self.values.get()
    }
}

/// Option key: name of the cluster the RPC was routed to. Consumed by the
/// cluster-manager load-balancing policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSelection(pub String);

/// Option key: 64-bit key consumed by consistent-hash load-balancing
/// policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcHash(pub u64);

/// Arguments describing the RPC being routed.
pub struct PickArgs<'a> {
    pub method: &'a MethodDescriptor,
    pub headers: &'a MetadataMap,
    pub call_options: &'a CallOptions,
}

/// Observes one call's lifecycle. `on_close` is delivered exactly once on
/// every terminal path, including cancellation.
pub trait CallListener: Send {
    fn on_headers(&mut self, headers: MetadataMap);
    fn on_close(&mut self, status: Status, trailers: MetadataMap);
}

/// One in-flight client call.
pub trait ClientCall: Send {
    /// Begins the call. Must be invoked at most once.
    fn start(&mut self, listener: Box<dyn CallListener>, headers: MetadataMap);

    /// Tears the call down. The listener is closed with `CANCELLED` if the
    /// call has not already terminated.
    fn cancel(&mut self, message: &str);
}

/// Creates calls. Implemented by the host channel (and by interceptor
/// wrappers layered in front of it).
pub trait Channel: Send + Sync {
    fn new_call(&self, method: &MethodDescriptor, options: CallOptions) -> Box<dyn ClientCall>;
}

/// Wraps call creation, optionally rewriting options or substituting the
/// call itself.
pub trait ClientInterceptor: Send + Sync {
    fn intercept_call(
        &self,
        method: &MethodDescriptor,
        options: CallOptions,
        next: &Arc<dyn Channel>,
    ) -> Box<dyn ClientCall>;
}

/// Applies `interceptor` in front of `channel`.
pub fn intercept(channel: Arc<dyn Channel>, interceptor: Arc<dyn ClientInterceptor>) -> Arc<dyn Channel> {
    Arc::new(InterceptedChannel {
        interceptor,
        next: channel,
    })
}

struct InterceptedChannel {
    interceptor: Arc<dyn ClientInterceptor>,
    next: Arc<dyn Channel>,
}

impl Channel for InterceptedChannel {
    fn new_call(&self, method: &MethodDescriptor, options: CallOptions) -> Box<dyn ClientCall> {
        self.interceptor.intercept_call(method, options, &self.next)
    }
}

/// Collapses a chain into one interceptor. The first interceptor is the
/// outermost: its `intercept_call` runs first and everything after it sees
/// whatever that call produced.
///
/// # Panics
///
/// Panics when `interceptors` is empty.
pub fn combine_interceptors(
    mut interceptors: Vec<Arc<dyn ClientInterceptor>>,
) -> Arc<dyn ClientInterceptor> {
    assert!(!interceptors.is_empty(), "empty interceptors");
    if interceptors.len() == 1 {
        return interceptors.remove(0);
    }
    Arc::new(InterceptorChain { interceptors })
}

struct InterceptorChain {
    interceptors: Vec<Arc<dyn ClientInterceptor>>,
}

impl ClientInterceptor for InterceptorChain {
    fn intercept_call(
        &self,
        method: &MethodDescriptor,
        options: CallOptions,
        next: &Arc<dyn Channel>,
    ) -> Box<dyn ClientCall> {
        let mut channel = next.clone();
        for interceptor in self.interceptors.iter().skip(1).rev() {
            channel = intercept(channel, interceptor.clone());
        }
        self.interceptors[0].intercept_call(method, options, &channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct NoopCall;

    impl ClientCall for NoopCall {
        fn start(&mut self, _listener: Box<dyn CallListener>, _headers: MetadataMap) {}
        fn cancel(&mut self, _message: &str) {}
    }

    struct RecordingChannel {
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Channel for RecordingChannel {
        fn new_call(&self, _method: &MethodDescriptor, _options: CallOptions) -> Box<dyn ClientCall> {
            self.calls.lock().unwrap().push("channel");
            Box::new(NoopCall)
        }
    }

    struct TaggingInterceptor {
        tag: &'static str,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    impl ClientInterceptor for TaggingInterceptor {
        fn intercept_call(
            &self,
            method: &MethodDescriptor,
            options: CallOptions,
            next: &Arc<dyn Channel>,
        ) -> Box<dyn ClientCall> {
            self.calls.lock().unwrap().push(self.tag);
            next.new_call(method, options)
        }
    }

    #[test]
    fn call_options_round_trip_typed_values() {
        let options = CallOptions::new()
            .with_value(ClusterSelection("cluster-foo".to_string()))
            .with_value(RpcHash(42));
        assert_eq!(
            options.get::<ClusterSelection>(),
            Some(&ClusterSelection("cluster-foo".to_string()))
        );
        assert_eq!(options.get::<RpcHash>(), Some(&RpcHash(42)));
    }

    #[test]
    fn first_interceptor_is_outermost() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let combined = combine_interceptors(vec![
            Arc::new(TaggingInterceptor {
                tag: "first",
                calls: calls.clone(),
            }),
            Arc::new(TaggingInterceptor {
                tag: "second",
                calls: calls.clone(),
            }),
        ]);
        let channel: Arc<dyn Channel> = Arc::new(RecordingChannel {
            calls: calls.clone(),
        });
        let intercepted = intercept(channel, combined);
        intercepted.new_call(&MethodDescriptor::new("Svc/method"), CallOptions::new());
        assert_eq!(*calls.lock().unwrap(), vec!["first", "second", "channel"]);
    }
}
