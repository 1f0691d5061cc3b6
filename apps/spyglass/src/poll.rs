//! Thin REST reader for the polled-state collaborator.
//!
//! The library treats polled data as plain values handed to
//! [`crate::store::TelemetryStore::resolve_session`]; this poller only
//! exists so the binary has something to hand it.

use anyhow::Context;
use std::collections::HashMap;
use url::Url;

use persona_proto::PolledSession;

pub struct RestPoller {
    http: reqwest::Client,
    base: Url,
}

impl RestPoller {
    pub fn new(api_url: &str) -> anyhow::Result<Self> {
        let base = Url::parse(api_url).context("invalid api url")?;
        Ok(Self {
            http: reqwest::Client::new(),
            base,
        })
    }

    /// Current per-session live state of a study, keyed by session id.
    pub async fn sessions(
        &self,
        study_id: &str,
    ) -> anyhow::Result<HashMap<String, PolledSession>> {
        let url = self
            .base
            .join(&format!("/api/studies/{study_id}/sessions"))
            .context("building sessions url")?;
        let sessions = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(sessions)
    }

    /// Ids of the sessions currently registered for a study.
    pub async fn session_ids(&self, study_id: &str) -> anyhow::Result<Vec<String>> {
        let url = self
            .base
            .join(&format!("/api/studies/{study_id}/session-ids"))
            .context("building session-ids url")?;
        let ids = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(ids)
    }
}
