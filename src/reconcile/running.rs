// Session-running-state reconciliation. After a restart, sessions persisted
// as actively processing may be stale; the owning agent is asked whether a
// completion is still live. Uncertainty resolves to idle, never to busy.

use serde::Deserialize;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::ReconcileConfig;
use crate::session::{StateStore, StoreError};

/// Seam for the agent status query, mocked in tests.
#[async_trait]
pub trait AgentStatusProbe: Send + Sync {
    async fn is_running(&self, session_id: &str) -> anyhow::Result<bool>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentStatusResponse {
    is_running: bool,
}

/// Probe backed by `GET {base}/sessions/{id}/status`.
pub struct HttpAgentProbe {
    base_url: String,
    client: reqwest::Client,
}

impl HttpAgentProbe {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl AgentStatusProbe for HttpAgentProbe {
    async fn is_running(&self, session_id: &str) -> anyhow::Result<bool> {
        let url = format!("{}/sessions/{}/status", self.base_url, session_id);
        let response: AgentStatusResponse = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.is_running)
    }
}

#[derive(Debug, Default)]
pub struct RunningReconcileReport {
    /// Sessions reset to idle.
    pub reset: Vec<String>,
    /// Sessions confirmed still processing.
    pub confirmed: Vec<String>,
}

/// Check every session persisted as running against the agent, retrying
/// with bounded exponential backoff before defaulting to idle.
pub async fn reconcile_running(
    store: &StateStore,
    probe: &dyn AgentStatusProbe,
    config: &ReconcileConfig,
) -> Result<RunningReconcileReport, StoreError> {
    let mut report = RunningReconcileReport::default();

    for session in store.list_sessions() {
        if !session.running {
            continue;
        }

        if query_with_backoff(probe, &session.id, config).await {
            info!(session = %session.id, "agent confirms completion still running");
            report.confirmed.push(session.id);
            continue;
        }

        store.mutate_session::<_, (), StoreError>(&session.id, |s| {
            s.running = false;
            Ok(())
        })?;
        info!(session = %session.id, "reset stale running flag");
        report.reset.push(session.id);
    }

    Ok(report)
}

/// `true` only on a positive answer from the agent; errors exhaust the
/// retry budget and then count as not-running.
async fn query_with_backoff(
    probe: &dyn AgentStatusProbe,
    session_id: &str,
    config: &ReconcileConfig,
) -> bool {
    let mut backoff = Duration::from_millis(config.initial_backoff_ms);
    let max_backoff = Duration::from_millis(config.max_backoff_ms);

    for attempt in 1..=config.max_attempts.max(1) {
        match probe.is_running(session_id).await {
            Ok(running) => return running,
            Err(e) => {
                warn!(
                    session = session_id,
                    attempt,
                    error = %e,
                    "agent status query failed"
                );
            }
        }
        if attempt < config.max_attempts {
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(max_backoff);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct ScriptedProbe {
        calls: AtomicUsize,
        answers: Vec<anyhow::Result<bool>>,
    }

    impl ScriptedProbe {
        fn new(answers: Vec<anyhow::Result<bool>>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                answers,
            }
        }
    }

    #[async_trait]
    impl AgentStatusProbe for ScriptedProbe {
        async fn is_running(&self, _session_id: &str) -> anyhow::Result<bool> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.answers.get(i) {
                Some(Ok(v)) => Ok(*v),
                Some(Err(_)) | None => anyhow::bail!("agent unreachable"),
            }
        }
    }

    fn fast_config() -> ReconcileConfig {
        ReconcileConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
        }
    }

    fn store_with_running(dir: &std::path::Path) -> StateStore {
        let store = StateStore::open(dir).unwrap();
        let mut session = Session::new("s1", "p1", "w1", "demo");
        session.running = true;
        store.insert_session(session).unwrap();
        store
    }

    #[tokio::test]
    async fn unreachable_agent_resets_to_idle() {
        let dir = tempdir().unwrap();
        let store = store_with_running(dir.path());
        let probe = ScriptedProbe::new(vec![]);

        let report = reconcile_running(&store, &probe, &fast_config())
            .await
            .unwrap();
        assert_eq!(report.reset, vec!["s1".to_string()]);
        assert!(!store.get_session("s1").unwrap().running);
        // exhausted the retry budget before giving up
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn not_running_answer_resets_immediately() {
        let dir = tempdir().unwrap();
        let store = store_with_running(dir.path());
        let probe = ScriptedProbe::new(vec![Ok(false)]);

        let report = reconcile_running(&store, &probe, &fast_config())
            .await
            .unwrap();
        assert_eq!(report.reset, vec!["s1".to_string()]);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn running_answer_after_retries_is_preserved() {
        let dir = tempdir().unwrap();
        let store = store_with_running(dir.path());
        let probe = ScriptedProbe::new(vec![Err(anyhow::anyhow!("flaky")), Ok(true)]);

        let report = reconcile_running(&store, &probe, &fast_config())
            .await
            .unwrap();
        assert_eq!(report.confirmed, vec!["s1".to_string()]);
        assert!(store.get_session("s1").unwrap().running);
    }

    #[tokio::test]
    async fn idle_sessions_are_not_queried() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        store
            .insert_session(Session::new("s1", "p1", "w1", "demo"))
            .unwrap();
        let probe = ScriptedProbe::new(vec![Ok(true)]);

        let report = reconcile_running(&store, &probe, &fast_config())
            .await
            .unwrap();
        assert!(report.reset.is_empty());
        assert!(report.confirmed.is_empty());
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }
}
