//! Instrumentation wrappers
//!
//! An [`Instrument`] is a small builder describing what to capture around a
//! call. It never changes what the call returns: values, errors and panics
//! pass through untouched, and anything that goes wrong inside the wrapper is
//! logged and swallowed.
//!
//! ```ignore
//! let score = monitor
//!     .instrument("analyzer::score")
//!     .track_execution()
//!     .track_performance()
//!     .wrap(|post: Post| analyzer.score(&post));
//! ```

mod counters;
mod resources;

pub use counters::{record_api_call, record_db_op, CounterSnapshot};
pub use resources::{ResourceSampler, Sample};

use crate::aggregator::PerformanceMetric;
use crate::bus::EventBus;
use crate::events::{bounded, new_invocation_id, Event, EventPayload, EventType, ResourceUsage, NO_SESSION};
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bound for captured error stacks
const MAX_STACK_BYTES: usize = 4096;

#[derive(Clone)]
pub struct Instrument {
    bus: Arc<EventBus>,
    sampler: Arc<ResourceSampler>,
    max_snapshot_bytes: usize,
    function_name: String,
    session_id: String,
    execution: bool,
    performance: bool,
    step_weight: Option<f64>,
    parameters: Option<serde_json::Value>,
}

enum Outcome {
    Success {
        summary: String,
    },
    Failure {
        kind: String,
        message: String,
        stack: Option<String>,
    },
}

impl Instrument {
    pub fn new(
        bus: Arc<EventBus>,
        sampler: Arc<ResourceSampler>,
        max_snapshot_bytes: usize,
        function_name: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            sampler,
            max_snapshot_bytes,
            function_name: function_name.into(),
            session_id: NO_SESSION.to_string(),
            execution: false,
            performance: false,
            step_weight: None,
            parameters: None,
        }
    }

    /// Publish `function.started` and a terminal event per call
    pub fn track_execution(mut self) -> Self {
        self.execution = true;
        self
    }

    /// Publish `performance.recorded` per call
    pub fn track_performance(mut self) -> Self {
        self.performance = true;
        self
    }

    /// Count each call as one step of `session_id` carrying `weight`
    pub fn progress_step(mut self, session_id: impl Into<String>, weight: f64) -> Self {
        self.session_id = session_id.into();
        self.step_weight = Some(weight);
        self
    }

    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// Attach a bounded JSON snapshot of the call parameters
    pub fn with_params<P: Serialize + ?Sized>(mut self, params: &P) -> Self {
        self.parameters = self.snapshot(params);
        self
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    /// Run a sync call under instrumentation
    pub fn call<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> std::result::Result<T, E>,
        T: fmt::Debug,
        E: fmt::Debug + fmt::Display,
    {
        let invocation_id = new_invocation_id();
        let before = self.begin(&invocation_id);
        let started = Instant::now();

        let (outcome, counts) = counters::count_sync(|| catch_unwind(AssertUnwindSafe(f)));
        let elapsed = started.elapsed();

        match outcome {
            Ok(result) => {
                self.finish(&invocation_id, before, elapsed, counts, self.outcome_of(&result));
                result
            }
            Err(panic) => {
                self.finish(&invocation_id, before, elapsed, counts, panic_outcome(panic.as_ref()));
                resume_unwind(panic)
            }
        }
    }

    /// Run an async call under instrumentation
    pub async fn call_async<T, E, Fut>(&self, fut: Fut) -> std::result::Result<T, E>
    where
        Fut: Future<Output = std::result::Result<T, E>>,
        T: fmt::Debug,
        E: fmt::Debug + fmt::Display,
    {
        let invocation_id = new_invocation_id();
        let before = self.begin(&invocation_id);
        let started = Instant::now();

        let (outcome, counts) = counters::count_async(AssertUnwindSafe(fut).catch_unwind()).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(result) => {
                self.finish(&invocation_id, before, elapsed, counts, self.outcome_of(&result));
                result
            }
            Err(panic) => {
                self.finish(&invocation_id, before, elapsed, counts, panic_outcome(panic.as_ref()));
                resume_unwind(panic)
            }
        }
    }

    /// Turn `f` into an instrumented function with the same signature
    pub fn wrap<A, T, E, F>(self, f: F) -> impl Fn(A) -> std::result::Result<T, E>
    where
        F: Fn(A) -> std::result::Result<T, E>,
        T: fmt::Debug,
        E: fmt::Debug + fmt::Display,
    {
        move |arg| self.call(|| f(arg))
    }

    /// Like [`wrap`](Self::wrap), snapshotting each call's argument as its parameters
    pub fn wrap_with_args<A, T, E, F>(self, f: F) -> impl Fn(A) -> std::result::Result<T, E>
    where
        A: Serialize,
        F: Fn(A) -> std::result::Result<T, E>,
        T: fmt::Debug,
        E: fmt::Debug + fmt::Display,
    {
        move |arg| {
            let mut call = self.clone();
            call.parameters = self.snapshot(&arg);
            call.call(|| f(arg))
        }
    }

    fn snapshot<P: Serialize + ?Sized>(&self, params: &P) -> Option<serde_json::Value> {
        let value = match serde_json::to_value(params) {
            Ok(value) => value,
            Err(e) => {
                self.instrumentation_failure(&format!("parameter snapshot failed: {}", e));
                return None;
            }
        };

        let rendered = value.to_string();
        if rendered.len() <= self.max_snapshot_bytes {
            Some(value)
        } else {
            Some(serde_json::Value::String(bounded(rendered, self.max_snapshot_bytes)))
        }
    }

    fn outcome_of<T, E>(&self, result: &std::result::Result<T, E>) -> Outcome
    where
        T: fmt::Debug,
        E: fmt::Debug + fmt::Display,
    {
        match result {
            Ok(value) => Outcome::Success {
                summary: bounded(format!("{:?}", value), self.max_snapshot_bytes),
            },
            Err(err) => {
                let message = err.to_string();
                let debug = format!("{:?}", err);
                Outcome::Failure {
                    kind: error_kind::<E>(),
                    stack: (debug != message).then(|| bounded(debug, MAX_STACK_BYTES)),
                    message,
                }
            }
        }
    }

    fn begin(&self, invocation_id: &str) -> Option<Sample> {
        if self.execution {
            self.publish(
                EventType::FunctionStarted,
                invocation_id,
                EventPayload::Started {
                    parameters: self.parameters.clone(),
                },
            );
        }
        if let Some(weight) = self.step_weight {
            self.publish(
                EventType::StepStarted,
                invocation_id,
                EventPayload::Step {
                    step: self.function_name.clone(),
                    weight,
                },
            );
        }
        self.performance.then(|| self.sampler.sample())
    }

    fn finish(
        &self,
        invocation_id: &str,
        before: Option<Sample>,
        elapsed: Duration,
        counts: CounterSnapshot,
        outcome: Outcome,
    ) {
        let duration_ms = elapsed.as_secs_f64() * 1000.0;
        let resources: Option<ResourceUsage> =
            before.map(|before| ResourceSampler::usage_between(before, self.sampler.sample()));
        let success = matches!(outcome, Outcome::Success { .. });

        let step_message = match &outcome {
            Outcome::Failure { message, .. } => Some(message.clone()),
            Outcome::Success { .. } => None,
        };

        if self.execution {
            let payload = match outcome {
                Outcome::Success { summary } => EventPayload::Completed {
                    duration_ms,
                    result_summary: summary,
                    resources,
                },
                Outcome::Failure { kind, message, stack } => EventPayload::Failed {
                    duration_ms,
                    error_kind: kind,
                    message,
                    stack,
                    resources,
                },
            };
            let event_type = if success {
                EventType::FunctionCompleted
            } else {
                EventType::FunctionFailed
            };
            self.publish(event_type, invocation_id, payload);
        }

        if self.performance {
            let usage = resources.unwrap_or(ResourceUsage {
                memory_peak_bytes: 0,
                cpu_percent: 0.0,
            });
            self.publish(
                EventType::PerformanceRecorded,
                invocation_id,
                EventPayload::Performance(PerformanceMetric {
                    timestamp: chrono::Utc::now(),
                    session_id: self.session_id.clone(),
                    function_name: self.function_name.clone(),
                    execution_time_ms: duration_ms,
                    memory_peak_bytes: usage.memory_peak_bytes,
                    cpu_percent: usage.cpu_percent,
                    api_calls: counts.api_calls,
                    db_ops: counts.db_ops,
                    success,
                }),
            );
        }

        if let Some(weight) = self.step_weight {
            let step = self.function_name.clone();
            match step_message {
                None => self.publish(EventType::StepCompleted, invocation_id, EventPayload::Step { step, weight }),
                Some(message) => self.publish(
                    EventType::StepFailed,
                    invocation_id,
                    EventPayload::StepFailed { step, weight, message },
                ),
            }
        }
    }

    fn publish(&self, event_type: EventType, invocation_id: &str, payload: EventPayload) {
        self.bus.publish(Event::new(
            event_type,
            self.session_id.clone(),
            invocation_id,
            self.function_name.clone(),
            payload,
        ));
    }

    fn instrumentation_failure(&self, message: &str) {
        tracing::warn!(
            function = %self.function_name,
            error = message,
            "InstrumentationFailure"
        );
        crate::metrics::record_instrumentation_failure(&self.function_name);
    }
}

/// Short type name of the error, without module path or generics
fn error_kind<E>() -> String {
    let full = std::any::type_name::<E>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

fn panic_outcome(panic: &(dyn Any + Send)) -> Outcome {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    Outcome::Failure {
        kind: "panic".to_string(),
        message,
        stack: None,
    }
}
