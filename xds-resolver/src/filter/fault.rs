//! HTTP fault injection: delay and abort faults, fixed or driven by
//! request headers, with an optional cap on concurrently active faults.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tonic::metadata::MetadataMap;
use tonic::{Code, Status};

use crate::call::{
    CallListener, CallOptions, Channel, ClientCall, ClientInterceptor, MethodDescriptor, PickArgs,
};
use crate::filter::{FailingCall, Filter, FilterConfig, FAULT_FILTER_TYPE_URL};
use crate::random::ThreadSafeRandom;
use crate::sync::{ScheduledHandle, Scheduler};

/// Abort HTTP status code, e.g. `404`. Takes precedence over the gRPC
/// status header.
pub const HEADER_ABORT_HTTP_STATUS: &str = "x-envoy-fault-abort-request";
/// Abort gRPC status code.
pub const HEADER_ABORT_GRPC_STATUS: &str = "x-envoy-fault-abort-grpc-request";
/// Caps the abort percentage of a header-driven abort.
pub const HEADER_ABORT_PERCENTAGE: &str = "x-envoy-fault-abort-request-percentage";
/// Delay duration in milliseconds.
pub const HEADER_DELAY: &str = "x-envoy-fault-delay-request";
/// Caps the delay percentage of a header-driven delay.
pub const HEADER_DELAY_PERCENTAGE: &str = "x-envoy-fault-delay-request-percentage";

const NANOS_PER_MILLI: u64 = 1_000_000;

/// A fraction `numerator / denominator` with a fixed denominator scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FractionalPercent {
    numerator: u32,
    denominator: u32,
}

impl FractionalPercent {
    pub fn per_hundred(numerator: u32) -> Self {
        Self {
            numerator,
            denominator: 100,
        }
    }

    pub fn per_ten_thousand(numerator: u32) -> Self {
        Self {
            numerator,
            denominator: 10_000,
        }
    }

    pub fn per_million(numerator: u32) -> Self {
        Self {
            numerator,
            denominator: 1_000_000,
        }
    }

    pub fn numerator(&self) -> u32 {
        self.numerator
    }

    pub fn denominator(&self) -> u32 {
        self.denominator
    }
}

/// Postpones call start.
#[derive(Debug, Clone)]
pub enum FaultDelay {
    /// A fixed delay injected at `percent`.
    Fixed {
        delay_nanos: u64,
        percent: FractionalPercent,
    },
    /// Delay read from request metadata, injected at up to `percent`.
    Header { percent: FractionalPercent },
}

impl FaultDelay {
    pub fn for_fixed_delay(delay_nanos: u64, percent: FractionalPercent) -> Self {
        Self::Fixed {
            delay_nanos,
            percent,
        }
    }

    pub fn for_header(percent: FractionalPercent) -> Self {
        Self::Header { percent }
    }
}

/// Closes the call with a status instead of starting it.
#[derive(Debug, Clone)]
pub enum FaultAbort {
    /// A fixed status injected at `percent`.
    Fixed {
        code: Code,
        message: String,
        percent: FractionalPercent,
    },
    /// Status read from request metadata, injected at up to `percent`.
    Header { percent: FractionalPercent },
}

impl FaultAbort {
    pub fn for_status(code: Code, message: impl Into<String>, percent: FractionalPercent) -> Self {
        Self::Fixed {
            code,
            message: message.into(),
            percent,
        }
    }

    pub fn for_header(percent: FractionalPercent) -> Self {
        Self::Header { percent }
    }
}

/// Fault-injection settings for one filter instance (or an override).
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    delay: Option<FaultDelay>,
    abort: Option<FaultAbort>,
    max_active_faults: Option<u32>,
}

impl FaultConfig {
    pub fn new(
        delay: Option<FaultDelay>,
        abort: Option<FaultAbort>,
        max_active_faults: Option<u32>,
    ) -> Self {
        Self {
            delay,
            abort,
            max_active_faults,
        }
    }

    pub fn delay(&self) -> Option<&FaultDelay> {
        self.delay.as_ref()
    }

    pub fn abort(&self) -> Option<&FaultAbort> {
        self.abort.as_ref()
    }

    pub fn max_active_faults(&self) -> Option<u32> {
        self.max_active_faults
    }
}

/// The fault-injection filter. One instance per resolver, carrying the
/// shared randomness source and the count of faults currently in flight.
pub struct FaultFilter {
    random: Arc<dyn ThreadSafeRandom>,
    active_faults: Arc<AtomicI64>,
}

impl FaultFilter {
    pub fn new(random: Arc<dyn ThreadSafeRandom>) -> Self {
        Self {
            random,
            active_faults: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Decides whether the delay fault fires for this call, and with what
    /// duration.
    fn delay_nanos(&self, delay: &FaultDelay, headers: &MetadataMap) -> Option<u64> {
        match delay {
            FaultDelay::Fixed {
                delay_nanos,
                percent,
            } => self
                .roll(percent.numerator(), percent.denominator())
                .then_some(*delay_nanos),
            FaultDelay::Header { percent } => {
                let millis: u64 = ascii_header(headers, HEADER_DELAY)?.parse().ok()?;
                let numerator =
                    capped_numerator(*percent, ascii_header(headers, HEADER_DELAY_PERCENTAGE));
                self.roll(numerator, percent.denominator())
                    .then_some(millis.saturating_mul(NANOS_PER_MILLI))
            }
        }
    }

    /// Decides whether the abort fault fires for this call, and with what
    /// status.
    fn abort_status(&self, abort: &FaultAbort, headers: &MetadataMap) -> Option<Status> {
        match abort {
            FaultAbort::Fixed {
                code,
                message,
                percent,
            } => self
                .roll(percent.numerator(), percent.denominator())
                .then(|| Status::new(*code, message.clone())),
            FaultAbort::Header { percent } => {
                let status = abort_status_from_headers(headers)?;
                let numerator =
                    capped_numerator(*percent, ascii_header(headers, HEADER_ABORT_PERCENTAGE));
                self.roll(numerator, percent.denominator()).then_some(status)
            }
        }
    }

    fn roll(&self, numerator: u32, denominator: u32) -> bool {
        self.random.next_below(denominator) < numerator
    }
}

impl Filter for FaultFilter {
    fn type_urls(&self) -> &'static [&'static str] {
        &[FAULT_FILTER_TYPE_URL]
    }

    fn build_client_interceptor(
        &self,
        config: &FilterConfig,
        override_config: Option<&FilterConfig>,
        args: &PickArgs<'_>,
        scheduler: &Arc<dyn Scheduler>,
    ) -> Option<Arc<dyn ClientInterceptor>> {
        let FilterConfig::Fault(config) = override_config.unwrap_or(config) else {
            return None;
        };
        if let Some(max_active) = config.max_active_faults() {
            if self.active_faults.load(Ordering::Acquire) >= i64::from(max_active) {
                return None;
            }
        }
        let delay_nanos = config
            .delay()
            .and_then(|delay| self.delay_nanos(delay, args.headers));
        let abort_status = config
            .abort()
            .and_then(|abort| self.abort_status(abort, args.headers));
        if delay_nanos.is_none() && abort_status.is_none() {
            return None;
        }
        Some(Arc::new(FaultInjectionInterceptor {
            delay_nanos,
            abort_status,
            active_faults: Arc::clone(&self.active_faults),
            scheduler: Arc::clone(scheduler),
        }))
    }
}

fn capped_numerator(percent: FractionalPercent, header_value: Option<&str>) -> u32 {
    match header_value.and_then(|value| value.parse::<u32>().ok()) {
        Some(header) => percent.numerator().min(header),
        None => percent.numerator(),
    }
}

fn ascii_header<'a>(headers: &'a MetadataMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// The HTTP status header outranks the gRPC status header; HTTP statuses
/// surface as `UNIMPLEMENTED`.
fn abort_status_from_headers(headers: &MetadataMap) -> Option<Status> {
    if let Some(http_status) =
        ascii_header(headers, HEADER_ABORT_HTTP_STATUS).and_then(|v| v.parse::<u32>().ok())
    {
        return Some(Status::new(
            Code::Unimplemented,
            format!("HTTP status code {http_status}"),
        ));
    }
    let grpc_status = ascii_header(headers, HEADER_ABORT_GRPC_STATUS)?
        .parse::<i32>()
        .ok()?;
    Some(Status::new(Code::from_i32(grpc_status), String::new()))
}

/// Per-call interceptor produced once the fault decision has been made.
struct FaultInjectionInterceptor {
    delay_nanos: Option<u64>,
    abort_status: Option<Status>,
    active_faults: Arc<AtomicI64>,
    scheduler: Arc<dyn Scheduler>,
}

impl ClientInterceptor for FaultInjectionInterceptor {
    fn intercept_call(
        &self,
        method: &MethodDescriptor,
        options: CallOptions,
        next: &Arc<dyn Channel>,
    ) -> Box<dyn ClientCall> {
        match (self.delay_nanos, self.abort_status.clone()) {
            (Some(delay_nanos), abort_status) => {
                let guard = ActiveFaultGuard::acquire(Arc::clone(&self.active_faults));
                Box::new(DelayInjectedCall::new(
                    Duration::from_nanos(delay_nanos),
                    abort_status,
                    method.clone(),
                    options,
                    Arc::clone(next),
                    &self.scheduler,
                    guard,
                ))
            }
            (None, Some(status)) => {
                let guard = ActiveFaultGuard::acquire(Arc::clone(&self.active_faults));
                Box::new(FailingCall::with_callback(
                    status,
                    Box::new(move || guard.finish()),
                ))
            }
            (None, None) => next.new_call(method, options),
        }
    }
}

/// Holds one slot of the active-fault count, given back exactly once no
/// matter how the fault resolves.
struct ActiveFaultGuard {
    counter: Arc<AtomicI64>,
    finished: AtomicBool,
}

impl ActiveFaultGuard {
    fn acquire(counter: Arc<AtomicI64>) -> Arc<Self> {
        counter.fetch_add(1, Ordering::AcqRel);
        Arc::new(Self {
            counter,
            finished: AtomicBool::new(false),
        })
    }

    fn finish(&self) {
        if !self.finished.swap(true, Ordering::AcqRel) {
            self.counter.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// A call whose start is held back until the injected delay elapses; the
/// call may then proceed against the real channel or be closed with the
/// injected abort status.
struct DelayInjectedCall {
    state: Arc<Mutex<DelayState>>,
    guard: Arc<ActiveFaultGuard>,
    timer: Arc<dyn ScheduledHandle>,
}

struct DelayState {
    method: MethodDescriptor,
    options: CallOptions,
    channel: Arc<dyn Channel>,
    abort_status: Option<Status>,
    pending: Option<(Box<dyn CallListener>, MetadataMap)>,
    real_call: Option<Box<dyn ClientCall>>,
    elapsed: bool,
    cancelled: bool,
}

impl DelayInjectedCall {
    fn new(
        delay: Duration,
        abort_status: Option<Status>,
        method: MethodDescriptor,
        options: CallOptions,
        channel: Arc<dyn Channel>,
        scheduler: &Arc<dyn Scheduler>,
        guard: Arc<ActiveFaultGuard>,
    ) -> Self {
        let state = Arc::new(Mutex::new(DelayState {
            method,
            options,
            channel,
            abort_status,
            pending: None,
            real_call: None,
            elapsed: false,
            cancelled: false,
        }));
        let timer_state = Arc::clone(&state);
        let timer_guard = Arc::clone(&guard);
        let timer = scheduler.schedule(
            delay,
            Box::new(move || Self::on_delay_elapsed(&timer_state, &timer_guard)),
        );
        Self {
            state,
            guard,
            timer,
        }
    }

    fn on_delay_elapsed(state: &Arc<Mutex<DelayState>>, guard: &ActiveFaultGuard) {
        let mut state = state.lock().unwrap();
        if state.cancelled {
            return;
        }
        state.elapsed = true;
        if let Some((listener, headers)) = state.pending.take() {
            Self::proceed(&mut state, listener, headers, guard);
        }
    }

    fn proceed(
        state: &mut DelayState,
        mut listener: Box<dyn CallListener>,
        headers: MetadataMap,
        guard: &ActiveFaultGuard,
    ) {
        guard.finish();
        if let Some(status) = state.abort_status.take() {
            listener.on_close(status, MetadataMap::new());
            return;
        }
        let mut call = state.channel.new_call(&state.method, state.options.clone());
        call.start(listener, headers);
        state.real_call = Some(call);
    }
}

impl ClientCall for DelayInjectedCall {
    fn start(&mut self, mut listener: Box<dyn CallListener>, headers: MetadataMap) {
        let mut state = self.state.lock().unwrap();
        if state.cancelled {
            listener.on_close(Status::new(Code::Cancelled, "call cancelled"), MetadataMap::new());
            return;
        }
        if state.elapsed {
            Self::proceed(&mut state, listener, headers, &self.guard);
        } else {
            state.pending = Some((listener, headers));
        }
    }

    fn cancel(&mut self, message: &str) {
        let mut state = self.state.lock().unwrap();
        if state.cancelled {
            return;
        }
        state.cancelled = true;
        self.timer.cancel();
        self.guard.finish();
        if let Some(call) = state.real_call.as_mut() {
            call.cancel(message);
        } else if let Some((mut listener, _)) = state.pending.take() {
            // The delay never elapses for a cancelled call: the scheduled
            // task is cancelled and no abort is delivered.
            listener.on_close(Status::new(Code::Cancelled, message), MetadataMap::new());
        }
    }
}
