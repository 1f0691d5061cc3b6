//! Shared wire contract for viewer ↔ orchestrator telemetry.
//! Keeping this in a dedicated crate allows regeneration of bindings
//! for other language clients without pulling in the runtime code.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod frame;

pub use frame::{decode_session_frame, encode_session_frame, FrameError, SessionFrame, SESSION_ID_LEN};

/// Control frames the viewer sends on the event channel. One physical study
/// subscription is active at a time; switching studies sends an unsubscribe
/// for the old id followed by a subscribe for the new one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StudyControl {
    Subscribe { study_id: String },
    Unsubscribe { study_id: String },
}

/// Control frames the viewer sends on the screencast channel. Same shape as
/// [`StudyControl`] but keyed per session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrameControl {
    Subscribe { session_id: String },
    Unsubscribe { session_id: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StudyPhase {
    Navigating,
    Analyzing,
    Synthesizing,
}

/// Running or final cost figures reported by the orchestrator. Every field is
/// optional; partial reports are the norm while a study is in flight.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CostReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_usd: Option<f64>,
}

/// The persona's current action as it appears on the wire.
///
/// The emitter sends either a bare tag (`"clicking"`) or an object with a
/// `type` field (`{"type": "clicking"}`). Both shapes are part of the
/// contract; [`ActionField::tag`] is the single normalization point.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ActionField {
    Tag(String),
    Object {
        #[serde(rename = "type")]
        kind: String,
    },
}

impl ActionField {
    pub fn tag(&self) -> &str {
        match self {
            ActionField::Tag(tag) => tag,
            ActionField::Object { kind } => kind,
        }
    }
}

/// Per-session state as carried by a full-study snapshot, and by the polled
/// REST read. All fields are optional: a partial snapshot merges field by
/// field and must never erase state it does not mention.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub narration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_view_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screencast_available: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u32>,
}

/// Response shape of the excluded REST "current state" endpoint. Consumed by
/// the viewer as the lowest-precedence data source; never merged into the
/// reconciled record.
pub type PolledSession = SessionSnapshot;

/// Server-pushed events on the JSON channel, discriminated on `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    StudyProgress {
        study_id: String,
        percent: u8,
        phase: StudyPhase,
        #[serde(skip_serializing_if = "Option::is_none")]
        cost: Option<CostReport>,
    },
    SessionStep {
        #[serde(skip_serializing_if = "Option::is_none")]
        study_id: Option<String>,
        session_id: String,
        persona_name: String,
        step_number: u32,
        narration: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        frame_ref: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        emotion: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        action: Option<ActionField>,
        #[serde(skip_serializing_if = "Option::is_none")]
        task_progress: Option<u8>,
    },
    SessionComplete {
        #[serde(skip_serializing_if = "Option::is_none")]
        study_id: Option<String>,
        session_id: String,
        total_steps: u32,
    },
    SessionLiveView {
        session_id: String,
        live_view_url: String,
    },
    SessionBrowserClosed {
        session_id: String,
    },
    SessionScreencastReady {
        session_id: String,
    },
    StudySnapshot {
        study_id: String,
        sessions: HashMap<String, SessionSnapshot>,
    },
    StudyComplete {
        study_id: String,
        score: f64,
        issue_count: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        cost: Option<CostReport>,
    },
    StudyError {
        #[serde(skip_serializing_if = "Option::is_none")]
        study_id: Option<String>,
        message: String,
    },
}

impl ServerEvent {
    /// Study id carried by the event, when the event is study-scoped.
    pub fn study_id(&self) -> Option<&str> {
        match self {
            ServerEvent::StudyProgress { study_id, .. }
            | ServerEvent::StudySnapshot { study_id, .. }
            | ServerEvent::StudyComplete { study_id, .. } => Some(study_id),
            ServerEvent::SessionStep { study_id, .. }
            | ServerEvent::SessionComplete { study_id, .. }
            | ServerEvent::StudyError { study_id, .. } => study_id.as_deref(),
            ServerEvent::SessionLiveView { .. }
            | ServerEvent::SessionBrowserClosed { .. }
            | ServerEvent::SessionScreencastReady { .. } => None,
        }
    }
}
