use serde::{Deserialize, Serialize};

use persona_proto::SessionSnapshot;

/// History keeps the most recent entries only; older steps fall off silently.
pub const HISTORY_LIMIT: usize = 50;

pub const SYNTHETIC_START_STEP: u32 = 0;
pub const STARTING_NARRATION: &str = "Starting session";
pub const COMPLETED_NARRATION: &str = "Completed all tasks";
pub const DEFAULT_EMOTION: &str = "curious";
pub const COMPLETED_EMOTION: &str = "satisfied";

/// One step of a persona's run, as observed by the viewer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepEntry {
    pub step_number: u32,
    pub narration: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_ref: Option<String>,
    pub emotion: String,
    pub action: String,
    pub task_progress: u8,
    /// Local receipt time, unix milliseconds.
    pub received_at_ms: i64,
}

impl StepEntry {
    pub(crate) fn starting(received_at_ms: i64) -> Self {
        Self {
            step_number: SYNTHETIC_START_STEP,
            narration: STARTING_NARRATION.to_string(),
            frame_ref: None,
            emotion: DEFAULT_EMOTION.to_string(),
            action: "starting".to_string(),
            task_progress: 0,
            received_at_ms,
        }
    }

    pub(crate) fn completed(step_number: u32, received_at_ms: i64) -> Self {
        Self {
            step_number,
            narration: COMPLETED_NARRATION.to_string(),
            frame_ref: None,
            emotion: COMPLETED_EMOTION.to_string(),
            action: "done".to_string(),
            task_progress: 100,
            received_at_ms,
        }
    }
}

/// Reconciled state of one persona session. Owned exclusively by the
/// reconciler; readers only ever see clones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub session_id: String,
    pub persona_name: Option<String>,
    pub step_number: Option<u32>,
    pub narration: Option<String>,
    pub emotion: Option<String>,
    pub action: Option<String>,
    pub task_progress: Option<u8>,
    pub live_view_url: Option<String>,
    pub browser_active: bool,
    pub screencast_available: bool,
    pub completed: bool,
    pub total_steps: Option<u32>,
    /// Ascending by step number, no duplicates, at most [`HISTORY_LIMIT`]
    /// entries. Populated by step events only; snapshots never touch it.
    pub history: Vec<StepEntry>,
}

impl SessionRecord {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            persona_name: None,
            step_number: None,
            narration: None,
            emotion: None,
            action: None,
            task_progress: None,
            live_view_url: None,
            browser_active: false,
            screencast_available: false,
            completed: false,
            total_steps: None,
            history: Vec::new(),
        }
    }

    /// Insert a history entry in step order. Duplicates are skipped and the
    /// oldest entries are trimmed past the cap. Returns whether the entry
    /// was inserted.
    pub(crate) fn push_history(&mut self, entry: StepEntry) -> bool {
        match self
            .history
            .binary_search_by_key(&entry.step_number, |e| e.step_number)
        {
            Ok(_) => false,
            Err(pos) => {
                self.history.insert(pos, entry);
                while self.history.len() > HISTORY_LIMIT {
                    self.history.remove(0);
                }
                true
            }
        }
    }

    /// Field-by-field merge of a (possibly partial) snapshot. A field the
    /// snapshot does not carry keeps its current value, so a partial
    /// snapshot can never erase known state.
    pub(crate) fn merge_snapshot(&mut self, snapshot: &SessionSnapshot) {
        if let Some(persona_name) = &snapshot.persona_name {
            self.persona_name = Some(persona_name.clone());
        }
        if let Some(step_number) = snapshot.step_number {
            self.step_number = Some(step_number);
        }
        if let Some(narration) = &snapshot.narration {
            self.narration = Some(narration.clone());
        }
        if let Some(emotion) = &snapshot.emotion {
            self.emotion = Some(emotion.clone());
        }
        if let Some(action) = &snapshot.action {
            self.action = Some(action.clone());
        }
        if let Some(task_progress) = snapshot.task_progress {
            self.task_progress = Some(task_progress.min(100));
        }
        if let Some(live_view_url) = &snapshot.live_view_url {
            self.live_view_url = Some(live_view_url.clone());
        }
        if let Some(browser_active) = snapshot.browser_active {
            self.browser_active = browser_active;
        }
        if let Some(screencast_available) = snapshot.screencast_available {
            self.screencast_available = screencast_available;
        }
        if let Some(completed) = snapshot.completed {
            self.completed = completed;
        }
        if let Some(total_steps) = snapshot.total_steps {
            self.total_steps = Some(total_steps);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(step: u32) -> StepEntry {
        StepEntry {
            step_number: step,
            narration: format!("step {step}"),
            frame_ref: None,
            emotion: "focused".into(),
            action: "reading".into(),
            task_progress: 10,
            received_at_ms: 0,
        }
    }

    #[test]
    fn history_stays_sorted_and_deduplicated() {
        let mut record = SessionRecord::new("p1");
        assert!(record.push_history(entry(2)));
        assert!(record.push_history(entry(1)));
        assert!(!record.push_history(entry(2)));
        assert!(record.push_history(entry(3)));

        let steps: Vec<u32> = record.history.iter().map(|e| e.step_number).collect();
        assert_eq!(steps, vec![1, 2, 3]);
    }

    #[test]
    fn history_drops_oldest_past_the_cap() {
        let mut record = SessionRecord::new("p1");
        for step in 0..(HISTORY_LIMIT as u32 + 10) {
            record.push_history(entry(step));
        }
        assert_eq!(record.history.len(), HISTORY_LIMIT);
        assert_eq!(record.history[0].step_number, 10);
        assert_eq!(
            record.history.last().unwrap().step_number,
            HISTORY_LIMIT as u32 + 9
        );
    }

    #[test]
    fn partial_snapshot_keeps_unmentioned_fields() {
        let mut record = SessionRecord::new("p1");
        record.narration = Some("browsing the catalog".into());
        record.live_view_url = Some("https://live/p1".into());

        record.merge_snapshot(&SessionSnapshot {
            emotion: Some("confused".into()),
            ..Default::default()
        });

        assert_eq!(record.emotion.as_deref(), Some("confused"));
        assert_eq!(record.narration.as_deref(), Some("browsing the catalog"));
        assert_eq!(record.live_view_url.as_deref(), Some("https://live/p1"));
    }
}
