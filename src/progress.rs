//! Per-session progress tracking
//!
//! A session is a weighted plan of steps. Each completed step adds its weight;
//! percent is the completed share of the total weight, clamped to 100 and never
//! decreasing. A failed step is counted but does not stop the session; only an
//! explicit abort does. Finished sessions (completed or aborted) move to an
//! archive so their final state stays queryable.

use crate::bus::{EventBus, SubscriptionId};
use crate::error::{MonitorError, Result};
use crate::events::{new_invocation_id, Event, EventPayload, EventType, NO_SESSION};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};

/// Finished sessions kept for lookups
const ARCHIVE_LIMIT: usize = 1024;

/// Tolerance for accumulated fractional weights (ten steps of 0.1 sum to 0.9999...)
const WEIGHT_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    NotStarted,
    Running,
    Completed,
    FailedTerminal,
}

impl SessionStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::FailedTerminal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SessionPlan {
    pub total_weight: f64,
    pub total_steps: u32,
}

impl SessionPlan {
    /// `total_steps` steps of weight 1 each
    pub fn steps(total_steps: u32) -> Self {
        Self {
            total_weight: total_steps as f64,
            total_steps,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressState {
    pub session_id: String,
    pub status: SessionStatus,
    pub current_step: Option<String>,
    pub percent: f64,
    pub completed_weight: f64,
    pub total_weight: f64,
    pub steps_completed: u32,
    pub total_steps: u32,
    pub started_at: DateTime<Utc>,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub last_update: DateTime<Utc>,
}

impl ProgressState {
    fn new(session_id: &str, plan: SessionPlan) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            status: SessionStatus::Running,
            current_step: None,
            percent: 0.0,
            completed_weight: 0.0,
            total_weight: plan.total_weight,
            steps_completed: 0,
            total_steps: plan.total_steps,
            started_at: now,
            estimated_completion: None,
            error_count: 0,
            last_error: None,
            last_update: now,
        }
    }

    fn apply_step(&mut self, step: &str, weight: f64, now: DateTime<Utc>) {
        self.completed_weight += weight.max(0.0);
        self.steps_completed += 1;
        self.current_step = Some(step.to_string());
        self.last_update = now;

        let percent = (100.0 * self.completed_weight / self.total_weight).clamp(0.0, 100.0);
        self.percent = self.percent.max(percent);

        if self.completed_weight > 0.0 {
            let elapsed_ms = (now - self.started_at).num_milliseconds() as f64;
            let projected_ms = elapsed_ms * self.total_weight / self.completed_weight;
            self.estimated_completion = Some(self.started_at + chrono::Duration::milliseconds(projected_ms as i64));
        }

        let weight_done = self.completed_weight >= self.total_weight * (1.0 - WEIGHT_EPSILON);
        let steps_done = self.total_steps > 0 && self.steps_completed >= self.total_steps;
        if weight_done || steps_done {
            self.status = SessionStatus::Completed;
            self.percent = 100.0;
            self.estimated_completion = Some(now);
        }
    }
}

pub struct ProgressTracker {
    bus: Weak<EventBus>,
    active: DashMap<String, ProgressState>,
    archived: DashMap<String, ProgressState>,
}

impl ProgressTracker {
    pub fn new(bus: &Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            bus: Arc::downgrade(bus),
            active: DashMap::new(),
            archived: DashMap::new(),
        })
    }

    /// Follow step events published by instrumented calls
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> Vec<SubscriptionId> {
        let on_completed = Arc::downgrade(self);
        let completed = bus.subscribe(EventType::StepCompleted, move |event: Arc<Event>| {
            let (Some(tracker), EventPayload::Step { step, weight }) = (on_completed.upgrade(), &event.payload) else {
                return;
            };
            if event.session_id == NO_SESSION {
                return;
            }
            if let Err(e) = tracker.complete_step(&event.session_id, step, *weight) {
                tracing::debug!(session_id = %event.session_id, error = %e, "Ignoring step completion");
            }
        });

        let on_failed = Arc::downgrade(self);
        let failed = bus.subscribe(EventType::StepFailed, move |event: Arc<Event>| {
            let (Some(tracker), EventPayload::StepFailed { message, .. }) = (on_failed.upgrade(), &event.payload) else {
                return;
            };
            if event.session_id == NO_SESSION {
                return;
            }
            if let Err(e) = tracker.record_error(&event.session_id, message) {
                tracing::debug!(session_id = %event.session_id, error = %e, "Ignoring step failure");
            }
        });

        vec![completed, failed]
    }

    pub fn start_session(&self, session_id: &str, plan: SessionPlan) -> Result<ProgressState> {
        if !(plan.total_weight.is_finite() && plan.total_weight > 0.0) {
            return Err(MonitorError::InvalidTransition {
                session_id: session_id.to_string(),
                message: format!("total weight must be positive, got {}", plan.total_weight),
            });
        }

        let state = match self.active.entry(session_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(MonitorError::InvalidTransition {
                    session_id: session_id.to_string(),
                    message: "session is already running".to_string(),
                });
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => slot.insert(ProgressState::new(session_id, plan)).clone(),
        };
        self.archived.remove(session_id);

        tracing::info!(
            session_id,
            total_weight = plan.total_weight,
            total_steps = plan.total_steps,
            "Progress session started"
        );
        self.publish_update(&state);
        Ok(state)
    }

    /// Add a completed step's weight to a running session
    pub fn complete_step(&self, session_id: &str, step: &str, weight: f64) -> Result<ProgressState> {
        let state = {
            let mut entry = self.running_entry(session_id)?;
            entry.apply_step(step, weight, Utc::now());
            entry.clone()
        };

        if state.status == SessionStatus::Completed {
            self.archive(session_id);
            tracing::info!(session_id, steps = state.steps_completed, "Progress session completed");
        }

        self.publish_update(&state);
        Ok(state)
    }

    /// Count a failed step; the session keeps running
    pub fn record_error(&self, session_id: &str, message: &str) -> Result<ProgressState> {
        let state = {
            let mut entry = self.running_entry(session_id)?;
            entry.error_count += 1;
            entry.last_error = Some(message.to_string());
            entry.last_update = Utc::now();
            entry.clone()
        };

        tracing::warn!(session_id, errors = state.error_count, error = message, "Progress step failed");
        self.publish_update(&state);
        Ok(state)
    }

    /// Stop a running session (`failed_terminal`); persisted entries are kept
    pub fn abort(&self, session_id: &str) -> Result<ProgressState> {
        let state = {
            let mut entry = self.running_entry(session_id)?;
            entry.status = SessionStatus::FailedTerminal;
            entry.estimated_completion = None;
            entry.last_update = Utc::now();
            entry.clone()
        };

        self.archive(session_id);
        tracing::warn!(session_id, percent = state.percent, "Progress session aborted");
        self.publish_update(&state);
        Ok(state)
    }

    /// Mark a running session complete regardless of remaining weight
    pub fn complete_session(&self, session_id: &str) -> Result<ProgressState> {
        let state = {
            let mut entry = self.running_entry(session_id)?;
            let now = Utc::now();
            entry.status = SessionStatus::Completed;
            entry.percent = 100.0;
            entry.estimated_completion = Some(now);
            entry.last_update = now;
            entry.clone()
        };

        self.archive(session_id);
        self.publish_update(&state);
        Ok(state)
    }

    /// Active state, else the archived final state
    pub fn get_current_progress(&self, session_id: &str) -> Option<ProgressState> {
        if let Some(state) = self.active.get(session_id) {
            return Some(state.clone());
        }
        self.archived.get(session_id).map(|s| s.clone())
    }

    pub fn active_sessions(&self) -> Vec<ProgressState> {
        let mut sessions: Vec<ProgressState> = self.active.iter().map(|e| e.value().clone()).collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        sessions
    }

    fn running_entry(
        &self,
        session_id: &str,
    ) -> Result<dashmap::mapref::one::RefMut<'_, String, ProgressState>> {
        match self.active.get_mut(session_id) {
            Some(entry) if entry.status == SessionStatus::Running => Ok(entry),
            Some(entry) => Err(MonitorError::InvalidTransition {
                session_id: session_id.to_string(),
                message: format!("session is {:?}", entry.status),
            }),
            None if self.archived.contains_key(session_id) => Err(MonitorError::InvalidTransition {
                session_id: session_id.to_string(),
                message: "session already finished".to_string(),
            }),
            None => Err(MonitorError::SessionNotFound(session_id.to_string())),
        }
    }

    fn archive(&self, session_id: &str) {
        let Some((id, state)) = self.active.remove(session_id) else {
            return;
        };

        if self.archived.len() >= ARCHIVE_LIMIT {
            let oldest = self
                .archived
                .iter()
                .min_by_key(|e| e.value().last_update)
                .map(|e| e.key().clone());
            if let Some(oldest) = oldest {
                self.archived.remove(&oldest);
            }
        }
        self.archived.insert(id, state);
    }

    fn publish_update(&self, state: &ProgressState) {
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        let step = state.current_step.clone().unwrap_or_default();
        bus.publish(Event::new(
            EventType::ProgressUpdated,
            state.session_id.clone(),
            new_invocation_id(),
            step.clone(),
            EventPayload::ProgressUpdated {
                step,
                percent: state.percent,
            },
        ));
    }
}
