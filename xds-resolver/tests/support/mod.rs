//! Deterministic test doubles for driving the resolver end to end: a
//! scripted xDS client, a manual-clock scheduler, a stubbed randomness
//! source, and a channel that records calls instead of sending them.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tonic::metadata::MetadataMap;
use tonic::Status;

use xds_resolver::client::{
    LdsUpdate, RdsUpdate, ResourceWatcher, XdsClient, XdsClientSource, XdsInitError,
};
use xds_resolver::random::ThreadSafeRandom;
use xds_resolver::resolver::{ResolutionResult, ResolverListener};
use xds_resolver::resource::{Route, VirtualHost};
use xds_resolver::service_config::{ParsedServiceConfig, ServiceConfigParser};
use xds_resolver::sync::{ScheduledHandle, Scheduler};
use xds_resolver::{
    CallListener, CallOptions, Channel, ClientCall, ClusterSelection, MethodDescriptor, RpcHash,
};

/// Passes generated configs through unchanged, like a channel that
/// accepts whatever the resolver produces.
pub struct EchoParser;

impl ServiceConfigParser for EchoParser {
    fn parse_service_config(&self, raw_service_config: &Value) -> Result<ParsedServiceConfig, Status> {
        Ok(Arc::new(raw_service_config.clone()))
    }
}

/// Fails to parse any config containing a method config; everything else
/// passes through.
pub struct MethodConfigRejectingParser;

impl ServiceConfigParser for MethodConfigRejectingParser {
    fn parse_service_config(&self, raw_service_config: &Value) -> Result<ParsedServiceConfig, Status> {
        if raw_service_config.get("methodConfig").is_some() {
            return Err(Status::new(
                tonic::Code::InvalidArgument,
                "unsupported method config",
            ));
        }
        Ok(Arc::new(raw_service_config.clone()))
    }
}

/// Stubbed randomness: per-bound queues of values where the last value
/// sticks, and zero for anything unstubbed.
#[derive(Default)]
pub struct FakeRandom {
    bounded: Mutex<HashMap<u32, VecDeque<u32>>>,
}

impl FakeRandom {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues return values for `next_below(bound)`; the final value
    /// repeats forever.
    pub fn stub_next_below(&self, bound: u32, values: impl IntoIterator<Item = u32>) {
        self.bounded
            .lock()
            .unwrap()
            .insert(bound, values.into_iter().collect());
    }
}

impl ThreadSafeRandom for FakeRandom {
    fn next_below(&self, bound: u32) -> u32 {
        assert!(bound > 0, "bound must be positive");
        let mut bounded = self.bounded.lock().unwrap();
        match bounded.get_mut(&bound) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().copied().unwrap_or(0),
            None => 0,
        }
    }

    fn next_u64(&self) -> u64 {
        0
    }
}

/// Manual-clock scheduler: tasks fire only when the test forwards time.
#[derive(Default)]
pub struct FakeScheduler {
    inner: Mutex<FakeSchedulerState>,
}

#[derive(Default)]
struct FakeSchedulerState {
    now_nanos: u64,
    tasks: Vec<FakeTask>,
}

struct FakeTask {
    due_nanos: u64,
    task: Box<dyn FnOnce() + Send>,
    cancelled: Arc<AtomicBool>,
}

struct FakeScheduledHandle {
    cancelled: Arc<AtomicBool>,
}

impl ScheduledHandle for FakeScheduledHandle {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl FakeScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the clock, running every task that falls due, in due
    /// order.
    pub fn forward_nanos(&self, nanos: u64) {
        let deadline = {
            let mut state = self.inner.lock().unwrap();
            state.now_nanos += nanos;
            state.now_nanos
        };
        loop {
            let next = {
                let mut state = self.inner.lock().unwrap();
                state.tasks.retain(|t| !t.cancelled.load(Ordering::SeqCst));
                let due_index = state
                    .tasks
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.due_nanos <= deadline)
                    .min_by_key(|(_, t)| t.due_nanos)
                    .map(|(i, _)| i);
                due_index.map(|i| state.tasks.remove(i))
            };
            match next {
                Some(task) => (task.task)(),
                None => return,
            }
        }
    }

    /// Number of scheduled, not-yet-cancelled tasks.
    pub fn pending_tasks(&self) -> usize {
        let mut state = self.inner.lock().unwrap();
        state.tasks.retain(|t| !t.cancelled.load(Ordering::SeqCst));
        state.tasks.len()
    }
}

impl Scheduler for FakeScheduler {
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) -> Arc<dyn ScheduledHandle> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut state = self.inner.lock().unwrap();
        let due_nanos = state.now_nanos + delay.as_nanos() as u64;
        state.tasks.push(FakeTask {
            due_nanos,
            task,
            cancelled: cancelled.clone(),
        });
        Arc::new(FakeScheduledHandle { cancelled })
    }
}

/// Scripted xDS client: the test delivers updates, errors and
/// does-not-exist events by hand. Enforces the at-most-one-watch-per-type
/// contract.
pub struct FakeXdsClient {
    authority: String,
    inner: Mutex<FakeXdsClientState>,
}

#[derive(Default)]
struct FakeXdsClientState {
    lds_resource: Option<String>,
    lds_watcher: Option<Arc<dyn ResourceWatcher<LdsUpdate>>>,
    rds_resource: Option<String>,
    rds_watcher: Option<Arc<dyn ResourceWatcher<RdsUpdate>>>,
}

impl FakeXdsClient {
    pub fn new(authority: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
            inner: Mutex::new(FakeXdsClientState::default()),
        }
    }

    pub fn lds_resource(&self) -> Option<String> {
        self.inner.lock().unwrap().lds_resource.clone()
    }

    pub fn rds_resource(&self) -> Option<String> {
        self.inner.lock().unwrap().rds_resource.clone()
    }

    fn lds_watcher(&self) -> Arc<dyn ResourceWatcher<LdsUpdate>> {
        self.inner
            .lock()
            .unwrap()
            .lds_watcher
            .clone()
            .expect("no LDS watcher registered")
    }

    pub fn deliver_lds_update(&self, update: LdsUpdate) {
        self.lds_watcher().on_changed(update);
    }

    /// Wraps `routes` in a virtual host for the resolver's authority.
    pub fn deliver_lds_routes(&self, routes: Vec<Route>) {
        let virtual_host = VirtualHost::new(
            "virtual-host",
            vec![self.authority.clone()],
            routes,
            HashMap::new(),
        );
        self.deliver_lds_update(LdsUpdate::for_virtual_hosts(0, vec![virtual_host], None));
    }

    pub fn deliver_lds_update_for_rds_name(&self, rds_name: &str) {
        self.deliver_lds_update(LdsUpdate::for_rds_name(0, rds_name, None));
    }

    pub fn deliver_lds_resource_not_found(&self) {
        let authority = self.authority.clone();
        self.lds_watcher().on_resource_does_not_exist(&authority);
    }

    pub fn deliver_rds_update(&self, resource_name: &str, virtual_hosts: Vec<VirtualHost>) {
        let watcher = {
            let state = self.inner.lock().unwrap();
            if state.rds_resource.as_deref() != Some(resource_name) {
                return;
            }
            state.rds_watcher.clone().expect("no RDS watcher registered")
        };
        watcher.on_changed(RdsUpdate { virtual_hosts });
    }

    pub fn deliver_rds_resource_not_found(&self, resource_name: &str) {
        let watcher = {
            let state = self.inner.lock().unwrap();
            if state.rds_resource.as_deref() != Some(resource_name) {
                return;
            }
            state.rds_watcher.clone().expect("no RDS watcher registered")
        };
        watcher.on_resource_does_not_exist(resource_name);
    }

    /// Fires the error on every active watcher, like a transport failure
    /// observed by both resource channels.
    pub fn deliver_error(&self, error: Status) {
        let (lds, rds) = {
            let state = self.inner.lock().unwrap();
            (state.lds_watcher.clone(), state.rds_watcher.clone())
        };
        if let Some(watcher) = lds {
            watcher.on_error(error.clone());
        }
        if let Some(watcher) = rds {
            watcher.on_error(error);
        }
    }
}

impl XdsClient for FakeXdsClient {
    fn watch_lds_resource(&self, resource_name: &str, watcher: Arc<dyn ResourceWatcher<LdsUpdate>>) {
        let mut state = self.inner.lock().unwrap();
        assert!(state.lds_watcher.is_none(), "LDS watch already registered");
        assert_eq!(resource_name, self.authority);
        state.lds_resource = Some(resource_name.to_string());
        state.lds_watcher = Some(watcher);
    }

    fn cancel_lds_resource_watch(
        &self,
        resource_name: &str,
        _watcher: &Arc<dyn ResourceWatcher<LdsUpdate>>,
    ) {
        let mut state = self.inner.lock().unwrap();
        assert!(state.lds_watcher.is_some(), "no LDS watch to cancel");
        assert_eq!(resource_name, self.authority);
        state.lds_resource = None;
        state.lds_watcher = None;
    }

    fn watch_rds_resource(&self, resource_name: &str, watcher: Arc<dyn ResourceWatcher<RdsUpdate>>) {
        let mut state = self.inner.lock().unwrap();
        assert!(state.rds_watcher.is_none(), "RDS watch already registered");
        state.rds_resource = Some(resource_name.to_string());
        state.rds_watcher = Some(watcher);
    }

    fn cancel_rds_resource_watch(
        &self,
        resource_name: &str,
        _watcher: &Arc<dyn ResourceWatcher<RdsUpdate>>,
    ) {
        let mut state = self.inner.lock().unwrap();
        assert_eq!(state.rds_resource.as_deref(), Some(resource_name));
        state.rds_resource = None;
        state.rds_watcher = None;
    }
}

/// Source handing out one fixed client.
pub struct FixedXdsClientSource {
    client: Arc<FakeXdsClient>,
}

impl FixedXdsClientSource {
    pub fn new(client: Arc<FakeXdsClient>) -> Self {
        Self { client }
    }
}

impl XdsClientSource for FixedXdsClientSource {
    fn xds_client(&self) -> Result<Arc<dyn XdsClient>, XdsInitError> {
        Ok(self.client.clone())
    }
}

/// Source that always fails, like an unreadable bootstrap file.
pub struct FailingXdsClientSource {
    pub message: &'static str,
}

impl XdsClientSource for FailingXdsClientSource {
    fn xds_client(&self) -> Result<Arc<dyn XdsClient>, XdsInitError> {
        Err(XdsInitError::new(self.message))
    }
}

/// Records every resolution result and error pushed downstream.
#[derive(Default)]
pub struct RecordingListener {
    results: Mutex<Vec<ResolutionResult>>,
    errors: Mutex<Vec<Status>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_results(&self) -> Vec<ResolutionResult> {
        std::mem::take(&mut self.results.lock().unwrap())
    }

    pub fn take_errors(&self) -> Vec<Status> {
        std::mem::take(&mut self.errors.lock().unwrap())
    }

    pub fn result_count(&self) -> usize {
        self.results.lock().unwrap().len()
    }
}

impl ResolverListener for RecordingListener {
    fn on_result(&self, result: ResolutionResult) {
        self.results.lock().unwrap().push(result);
    }

    fn on_error(&self, error: Status) {
        self.errors.lock().unwrap().push(error);
    }
}

/// The raw JSON the [`EchoParser`] wrapped.
pub fn raw_config(config: &ParsedServiceConfig) -> Value {
    config
        .downcast_ref::<Value>()
        .expect("config was not produced by EchoParser")
        .clone()
}

/// Channel that records calls; tests deliver headers and closes by hand.
#[derive(Clone, Default)]
pub struct TestChannel {
    inner: Arc<Mutex<Option<TestCallHandle>>>,
}

impl TestChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently created call, if any, clearing the slot.
    pub fn take_call(&self) -> Option<TestCallHandle> {
        self.inner.lock().unwrap().take()
    }
}

impl Channel for TestChannel {
    fn new_call(&self, _method: &MethodDescriptor, options: CallOptions) -> Box<dyn ClientCall> {
        let state = Arc::new(Mutex::new(TestCallState {
            options,
            listener: None,
            cancelled: None,
        }));
        *self.inner.lock().unwrap() = Some(TestCallHandle {
            state: state.clone(),
        });
        Box::new(TestCall { state })
    }
}

struct TestCallState {
    options: CallOptions,
    listener: Option<Box<dyn CallListener>>,
    cancelled: Option<String>,
}

struct TestCall {
    state: Arc<Mutex<TestCallState>>,
}

impl ClientCall for TestCall {
    fn start(&mut self, listener: Box<dyn CallListener>, _headers: MetadataMap) {
        self.state.lock().unwrap().listener = Some(listener);
    }

    fn cancel(&mut self, message: &str) {
        let listener = {
            let mut state = self.state.lock().unwrap();
            if state.cancelled.is_some() {
                return;
            }
            state.cancelled = Some(message.to_string());
            state.listener.take()
        };
        if let Some(mut listener) = listener {
            listener.on_close(
                Status::new(tonic::Code::Cancelled, message),
                MetadataMap::new(),
            );
        }
    }
}

/// Test-side view of one recorded call.
#[derive(Clone)]
pub struct TestCallHandle {
    state: Arc<Mutex<TestCallState>>,
}

impl TestCallHandle {
    pub fn cluster(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .options
            .get::<ClusterSelection>()
            .map(|selection| selection.0.clone())
    }

    pub fn rpc_hash(&self) -> Option<u64> {
        self.state
            .lock()
            .unwrap()
            .options
            .get::<RpcHash>()
            .map(|hash| hash.0)
    }

    pub fn deliver_response_headers(&self) {
        let mut listener = self
            .state
            .lock()
            .unwrap()
            .listener
            .take()
            .expect("call not started");
        listener.on_headers(MetadataMap::new());
        self.state.lock().unwrap().listener = Some(listener);
    }

    pub fn deliver_completed(&self) {
        let mut listener = self
            .state
            .lock()
            .unwrap()
            .listener
            .take()
            .expect("call not started");
        listener.on_close(Status::new(tonic::Code::Ok, ""), MetadataMap::new());
    }

    pub fn deliver_error_status(&self) {
        let mut listener = self
            .state
            .lock()
            .unwrap()
            .listener
            .take()
            .expect("call not started");
        listener.on_close(
            Status::new(tonic::Code::Unavailable, "server error"),
            MetadataMap::new(),
        );
    }
}

/// Observes one call's lifecycle from the application side.
#[derive(Clone, Default)]
pub struct CallObserver {
    state: Arc<Mutex<ObservedState>>,
}

#[derive(Default)]
struct ObservedState {
    headers: bool,
    closed: Option<Status>,
}

impl CallObserver {
    pub fn new() -> (Self, Box<dyn CallListener>) {
        let observer = Self::default();
        let listener = Box::new(ObservingListener {
            state: observer.state.clone(),
        });
        (observer, listener)
    }

    pub fn headers_received(&self) -> bool {
        self.state.lock().unwrap().headers
    }

    pub fn close_status(&self) -> Option<Status> {
        self.state.lock().unwrap().closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed.is_some()
    }
}

struct ObservingListener {
    state: Arc<Mutex<ObservedState>>,
}

impl CallListener for ObservingListener {
    fn on_headers(&mut self, _headers: MetadataMap) {
        self.state.lock().unwrap().headers = true;
    }

    fn on_close(&mut self, status: Status, _trailers: MetadataMap) {
        let mut state = self.state.lock().unwrap();
        assert!(state.closed.is_none(), "call closed twice");
        state.closed = Some(status);
    }
}
