//! Field-level precedence resolution for display.
//!
//! The precedence order for any displayed field is a contract, not
//! incidental null-handling: live event-derived state first (snapshots have
//! already been merged into the record), then the caller-supplied polled
//! read, then a static default.

use serde::Serialize;

use persona_proto::PolledSession;

use super::record::{DEFAULT_EMOTION, SessionRecord};

pub const FALLBACK_NARRATION: &str = "Starting…";

/// Fully-populated view of one session, ready to render.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResolvedSession {
    pub session_id: String,
    pub persona_name: String,
    pub step_number: u32,
    pub narration: String,
    pub emotion: String,
    pub action: String,
    pub task_progress: u8,
    pub live_view_url: Option<String>,
    pub browser_active: bool,
    pub screencast_available: bool,
    pub completed: bool,
    pub total_steps: Option<u32>,
}

pub fn resolve_session(
    session_id: &str,
    live: Option<&SessionRecord>,
    polled: Option<&PolledSession>,
    default_action: &str,
) -> ResolvedSession {
    ResolvedSession {
        session_id: session_id.to_string(),
        persona_name: pick(
            live.and_then(|r| r.persona_name.as_deref()),
            polled.and_then(|p| p.persona_name.as_deref()),
            session_id,
        ),
        step_number: live
            .and_then(|r| r.step_number)
            .or(polled.and_then(|p| p.step_number))
            .unwrap_or(0),
        narration: pick(
            live.and_then(|r| r.narration.as_deref()),
            polled.and_then(|p| p.narration.as_deref()),
            FALLBACK_NARRATION,
        ),
        emotion: pick(
            live.and_then(|r| r.emotion.as_deref()),
            polled.and_then(|p| p.emotion.as_deref()),
            DEFAULT_EMOTION,
        ),
        action: pick(
            live.and_then(|r| r.action.as_deref()),
            polled.and_then(|p| p.action.as_deref()),
            default_action,
        ),
        task_progress: live
            .and_then(|r| r.task_progress)
            .or(polled.and_then(|p| p.task_progress))
            .unwrap_or(0)
            .min(100),
        live_view_url: live
            .and_then(|r| r.live_view_url.clone())
            .or_else(|| polled.and_then(|p| p.live_view_url.clone())),
        browser_active: live
            .map(|r| r.browser_active)
            .or(polled.and_then(|p| p.browser_active))
            .unwrap_or(false),
        screencast_available: live
            .map(|r| r.screencast_available)
            .or(polled.and_then(|p| p.screencast_available))
            .unwrap_or(false),
        completed: live
            .map(|r| r.completed)
            .or(polled.and_then(|p| p.completed))
            .unwrap_or(false),
        total_steps: live
            .and_then(|r| r.total_steps)
            .or(polled.and_then(|p| p.total_steps)),
    }
}

fn pick(live: Option<&str>, polled: Option<&str>, fallback: &str) -> String {
    live.or(polled).unwrap_or(fallback).to_string()
}
