//! Read/subscribe façade over the reconciler.
//!
//! Single-writer rule: the record map is mutated only through
//! [`TelemetryStore::apply_event`]; readers always receive cloned snapshots
//! and never references into the map. Change notification is a coalesced
//! "something changed" tick; consumers re-read full snapshots, never
//! deltas.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

use persona_proto::{PolledSession, ServerEvent};

use crate::reconcile::{
    Applied, ResolvedSession, SessionRecord, StudyTelemetry, resolve_session,
};

const CHANGE_BUFFER: usize = 256;

/// What changed; carries ids only, the data is read back from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    Study { study_id: String },
    Session { study_id: String, session_id: String },
    Reset,
}

#[derive(Clone)]
pub struct TelemetryStore {
    inner: Arc<RwLock<Option<StudyTelemetry>>>,
    changes: broadcast::Sender<StoreChange>,
    default_action: String,
}

impl TelemetryStore {
    pub fn new(default_action: impl Into<String>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            inner: Arc::new(RwLock::new(None)),
            changes,
            default_action: default_action.into(),
        }
    }

    /// Start watching a study, replacing any previous state wholesale.
    pub fn init_study(&self, study_id: &str) {
        *self.inner.write() = Some(StudyTelemetry::new(study_id));
        self.notify(StoreChange::Reset);
    }

    /// Drop all reconciled state, e.g. when the viewer navigates away.
    pub fn reset(&self) {
        *self.inner.write() = None;
        self.notify(StoreChange::Reset);
    }

    /// Feed one server event into the reconciler.
    pub fn apply_event(&self, event: &ServerEvent) {
        let applied = {
            let mut inner = self.inner.write();
            match inner.as_mut() {
                Some(study) => study.apply(event, &self.default_action),
                None => {
                    trace!("ignoring event with no study initialized");
                    Applied::Ignored
                }
            }
        };
        let study_id = match self.inner.read().as_ref() {
            Some(study) => study.study_id.clone(),
            None => return,
        };
        match applied {
            Applied::Ignored => {}
            Applied::Study => self.notify(StoreChange::Study { study_id }),
            Applied::Session(session_id) => self.notify(StoreChange::Session {
                study_id,
                session_id,
            }),
        }
    }

    /// Snapshot of the whole study state, if one is initialized.
    pub fn study(&self) -> Option<StudyTelemetry> {
        self.inner.read().clone()
    }

    pub fn session(&self, session_id: &str) -> Option<SessionRecord> {
        self.inner
            .read()
            .as_ref()
            .and_then(|study| study.session(session_id).cloned())
    }

    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.inner
            .read()
            .as_ref()
            .map(|study| study.sessions.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Render-ready view of one session, combining live state with the
    /// caller's latest polled read under the fixed precedence order.
    pub fn resolve_session(
        &self,
        session_id: &str,
        polled: Option<&PolledSession>,
    ) -> ResolvedSession {
        let inner = self.inner.read();
        let live = inner.as_ref().and_then(|study| study.session(session_id));
        resolve_session(session_id, live, polled, &self.default_action)
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    /// Best-effort cache hook: serialize the current reconciled state.
    pub fn export(&self) -> Option<serde_json::Value> {
        let inner = self.inner.read();
        inner
            .as_ref()
            .and_then(|study| serde_json::to_value(study).ok())
    }

    /// Best-effort cache hook: restore previously exported state. Garbage
    /// input is rejected, never a panic.
    pub fn restore(&self, value: &serde_json::Value) -> bool {
        match serde_json::from_value::<StudyTelemetry>(value.clone()) {
            Ok(study) => {
                *self.inner.write() = Some(study);
                self.notify(StoreChange::Reset);
                true
            }
            Err(err) => {
                trace!(error = %err, "rejecting unrestorable cached state");
                false
            }
        }
    }

    fn notify(&self, change: StoreChange) {
        // No receivers is fine; notifications are fire-and-forget.
        let _ = self.changes.send(change);
    }
}
