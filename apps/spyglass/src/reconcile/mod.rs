//! The state reconciler: merges push events, full-study snapshots and polled
//! reads into one bounded record per session.
//!
//! Merging is pure and synchronous; each inbound occurrence is applied once.
//! The rules are order-tolerant by construction (duplicate step numbers are
//! idempotent, partial snapshots are non-destructive) because the two
//! channels deliver independently and in any relative order.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use time::OffsetDateTime;

use persona_proto::{ActionField, CostReport, ServerEvent, SessionSnapshot, StudyPhase};

mod record;
mod resolve;

pub use record::{
    COMPLETED_EMOTION, COMPLETED_NARRATION, DEFAULT_EMOTION, HISTORY_LIMIT, STARTING_NARRATION,
    SYNTHETIC_START_STEP, SessionRecord, StepEntry,
};
pub use resolve::{FALLBACK_NARRATION, ResolvedSession, resolve_session};

/// Diagnostic log keeps the most recent lines only.
pub const TRACE_LOG_LIMIT: usize = 200;

const TRACE_TEXT_LIMIT: usize = 80;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TraceLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceLine {
    pub level: TraceLevel,
    pub message: String,
    pub at_ms: i64,
}

/// Outcome of applying one input to the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// Event belonged to another study, or carried nothing new.
    Ignored,
    /// Study-level state changed.
    Study,
    /// One session's record changed.
    Session(String),
}

/// Reconciled state of the watched study: study-level fields plus one record
/// per session and a rolling diagnostic log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StudyTelemetry {
    pub study_id: String,
    pub percent: u8,
    pub phase: Option<StudyPhase>,
    pub terminal: bool,
    pub score: Option<f64>,
    pub issue_count: Option<u32>,
    pub last_error: Option<String>,
    pub cost: Option<CostReport>,
    pub sessions: HashMap<String, SessionRecord>,
    pub trace: VecDeque<TraceLine>,
}

impl StudyTelemetry {
    pub fn new(study_id: impl Into<String>) -> Self {
        Self {
            study_id: study_id.into(),
            percent: 0,
            phase: None,
            terminal: false,
            score: None,
            issue_count: None,
            last_error: None,
            cost: None,
            sessions: HashMap::new(),
            trace: VecDeque::new(),
        }
    }

    /// Apply one server event. Events scoped to a different study are
    /// ignored entirely; no merge ever panics.
    pub fn apply(&mut self, event: &ServerEvent, default_action: &str) -> Applied {
        if let Some(study_id) = event.study_id() {
            if study_id != self.study_id {
                tracing::trace!(
                    event_study = %study_id,
                    watched = %self.study_id,
                    "ignoring event for another study"
                );
                return Applied::Ignored;
            }
        }

        match event {
            ServerEvent::StudyProgress {
                percent,
                phase,
                cost,
                ..
            } => {
                self.percent = (*percent).min(100);
                self.phase = Some(*phase);
                if let Some(cost) = cost {
                    self.merge_cost(cost);
                }
                self.push_trace(
                    TraceLevel::Info,
                    format!("study {}% ({:?})", self.percent, phase),
                );
                Applied::Study
            }
            ServerEvent::SessionStep {
                session_id,
                persona_name,
                step_number,
                narration,
                frame_ref,
                emotion,
                action,
                task_progress,
                ..
            } => {
                self.apply_step(
                    session_id,
                    persona_name,
                    *step_number,
                    narration,
                    frame_ref.as_deref(),
                    emotion.as_deref(),
                    action.as_ref(),
                    *task_progress,
                    default_action,
                );
                self.push_trace(
                    TraceLevel::Info,
                    format!(
                        "{persona_name} [{session_id}] step {step_number}: {}",
                        truncate(narration, TRACE_TEXT_LIMIT)
                    ),
                );
                Applied::Session(session_id.clone())
            }
            ServerEvent::SessionComplete {
                session_id,
                total_steps,
                ..
            } => {
                self.apply_completion(session_id, *total_steps);
                self.push_trace(
                    TraceLevel::Info,
                    format!("[{session_id}] completed after {total_steps} steps"),
                );
                Applied::Session(session_id.clone())
            }
            ServerEvent::SessionLiveView {
                session_id,
                live_view_url,
            } => {
                let record = self.session_mut(session_id);
                record.live_view_url = Some(live_view_url.clone());
                self.push_trace(TraceLevel::Info, format!("[{session_id}] live view ready"));
                Applied::Session(session_id.clone())
            }
            ServerEvent::SessionBrowserClosed { session_id } => {
                let record = self.session_mut(session_id);
                record.browser_active = false;
                self.push_trace(TraceLevel::Info, format!("[{session_id}] browser closed"));
                Applied::Session(session_id.clone())
            }
            ServerEvent::SessionScreencastReady { session_id } => {
                let record = self.session_mut(session_id);
                record.screencast_available = true;
                self.push_trace(
                    TraceLevel::Info,
                    format!("[{session_id}] screencast available"),
                );
                Applied::Session(session_id.clone())
            }
            ServerEvent::StudySnapshot { sessions, .. } => {
                self.apply_snapshot(sessions);
                self.push_trace(
                    TraceLevel::Info,
                    format!("snapshot merged, {} sessions", sessions.len()),
                );
                Applied::Study
            }
            ServerEvent::StudyComplete {
                score,
                issue_count,
                cost,
                ..
            } => {
                self.terminal = true;
                self.percent = 100;
                self.score = Some(*score);
                self.issue_count = Some(*issue_count);
                if let Some(cost) = cost {
                    self.merge_cost(cost);
                }
                self.push_trace(
                    TraceLevel::Info,
                    format!("study complete: score {score:.1}, {issue_count} issues"),
                );
                Applied::Study
            }
            ServerEvent::StudyError { message, .. } => {
                self.last_error = Some(message.clone());
                self.push_trace(
                    TraceLevel::Error,
                    format!("study error: {}", truncate(message, TRACE_TEXT_LIMIT)),
                );
                Applied::Study
            }
        }
    }

    /// Current record for a session, if any input has referenced it yet.
    pub fn session(&self, session_id: &str) -> Option<&SessionRecord> {
        self.sessions.get(session_id)
    }

    // Records are created lazily: a step, snapshot or auxiliary event may
    // arrive before the session's formal registration.
    fn session_mut(&mut self, session_id: &str) -> &mut SessionRecord {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionRecord::new(session_id))
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_step(
        &mut self,
        session_id: &str,
        persona_name: &str,
        step_number: u32,
        narration: &str,
        frame_ref: Option<&str>,
        emotion: Option<&str>,
        action: Option<&ActionField>,
        task_progress: Option<u8>,
        default_action: &str,
    ) {
        let now = now_ms();
        let record = self.session_mut(session_id);
        record.persona_name = Some(persona_name.to_string());

        if record.history.is_empty() && step_number > SYNTHETIC_START_STEP {
            record.push_history(StepEntry::starting(now));
        }

        let action_tag = action
            .map(|a| a.tag().to_string())
            .unwrap_or_else(|| default_action.to_string());
        let emotion_tag = emotion
            .map(str::to_string)
            .or_else(|| record.emotion.clone())
            .unwrap_or_else(|| DEFAULT_EMOTION.to_string());
        let progress = task_progress.or(record.task_progress).unwrap_or(0).min(100);

        record.push_history(StepEntry {
            step_number,
            narration: narration.to_string(),
            frame_ref: frame_ref.map(str::to_string),
            emotion: emotion_tag.clone(),
            action: action_tag.clone(),
            task_progress: progress,
            received_at_ms: now,
        });

        record.step_number = Some(step_number);
        record.narration = Some(narration.to_string());
        record.emotion = Some(emotion_tag);
        record.action = Some(action_tag);
        record.task_progress = Some(progress);
        record.browser_active = true;
        // live_view_url and screencast_available are sticky: step events do
        // not carry them and must not regress them.
    }

    fn apply_completion(&mut self, session_id: &str, total_steps: u32) {
        let now = now_ms();
        let record = self.session_mut(session_id);
        if record.completed {
            // Duplicate completion: the trailer is appended exactly once.
            return;
        }
        record.completed = true;
        record.total_steps = Some(total_steps);
        record.task_progress = Some(100);
        record.browser_active = false;
        record.emotion = Some(COMPLETED_EMOTION.to_string());
        record.narration = Some(COMPLETED_NARRATION.to_string());

        let trailer_step = record
            .history
            .last()
            .map(|entry| entry.step_number.saturating_add(1))
            .unwrap_or_else(|| total_steps.saturating_add(1));
        let trailer = StepEntry::completed(trailer_step, now);
        if !record.push_history(trailer.clone()) {
            // Step numbers saturate at u32::MAX; the trailer still has to
            // land, so it replaces the colliding entry.
            if let Some(entry) = record
                .history
                .iter_mut()
                .find(|entry| entry.step_number == trailer_step)
            {
                *entry = trailer;
            }
        }
    }

    fn apply_snapshot(&mut self, sessions: &HashMap<String, SessionSnapshot>) {
        for (session_id, snapshot) in sessions {
            self.session_mut(session_id).merge_snapshot(snapshot);
        }
    }

    fn merge_cost(&mut self, incoming: &CostReport) {
        let cost = self.cost.get_or_insert_with(CostReport::default);
        if incoming.input_tokens.is_some() {
            cost.input_tokens = incoming.input_tokens;
        }
        if incoming.output_tokens.is_some() {
            cost.output_tokens = incoming.output_tokens;
        }
        if incoming.total_usd.is_some() {
            cost.total_usd = incoming.total_usd;
        }
    }

    fn push_trace(&mut self, level: TraceLevel, message: String) {
        self.trace.push_back(TraceLine {
            level,
            message,
            at_ms: now_ms(),
        });
        while self.trace.len() > TRACE_LOG_LIMIT {
            self.trace.pop_front();
        }
    }
}

fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(max_chars).collect();
        out.push('…');
        out
    }
}
