//! Background model warm-up tasks.
//!
//! [`WarmupRegistry::start`] spawns a tokio task that runs the provider's
//! one-time [`EmbeddingProvider::load`] and returns an id the caller polls
//! with [`WarmupRegistry::status`]. The task runs on its own and never holds
//! a lock that query-path embedding needs.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use super::EmbeddingProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WarmupState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl WarmupState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WarmupState::Completed | WarmupState::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WarmupStatus {
    pub id: String,
    pub state: WarmupState,
    pub progress_pct: u8,
    pub error: Option<String>,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

#[derive(Clone, Default)]
pub struct WarmupRegistry {
    tasks: Arc<RwLock<HashMap<String, WarmupStatus>>>,
}

impl WarmupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a warm-up for `provider` and return its task id.
    pub fn start<P>(&self, provider: Arc<P>) -> String
    where
        P: EmbeddingProvider + ?Sized + 'static,
    {
        let id = Uuid::new_v4().to_string();
        let status = WarmupStatus {
            id: id.clone(),
            state: WarmupState::Pending,
            progress_pct: 0,
            error: None,
            started_at: chrono::Utc::now().timestamp(),
            finished_at: None,
        };
        self.write().insert(id.clone(), status);

        let registry = self.clone();
        let task_id = id.clone();
        tokio::spawn(async move {
            registry.update(&task_id, |s| {
                s.state = WarmupState::Running;
                s.progress_pct = 10;
            });

            let outcome = provider.load().await;
            let finished = chrono::Utc::now().timestamp();
            match outcome {
                Ok(()) => {
                    tracing::info!(task = %task_id, "embedding warm-up completed");
                    registry.update(&task_id, |s| {
                        s.state = WarmupState::Completed;
                        s.progress_pct = 100;
                        s.finished_at = Some(finished);
                    });
                }
                Err(e) => {
                    tracing::warn!(task = %task_id, error = %e, "embedding warm-up failed");
                    registry.update(&task_id, |s| {
                        s.state = WarmupState::Failed;
                        s.error = Some(e.to_string());
                        s.finished_at = Some(finished);
                    });
                }
            }
        });

        id
    }

    pub fn status(&self, id: &str) -> Option<WarmupStatus> {
        self.read().get(id).cloned()
    }

    /// All known tasks, oldest first.
    pub fn list(&self) -> Vec<WarmupStatus> {
        let mut all: Vec<WarmupStatus> = self.read().values().cloned().collect();
        all.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        all
    }

    /// Poll until the task reaches a terminal state. `None` for unknown ids.
    pub async fn wait(&self, id: &str, poll: Duration) -> Option<WarmupStatus> {
        loop {
            let status = self.status(id)?;
            if status.state.is_terminal() {
                return Some(status);
            }
            tokio::time::sleep(poll).await;
        }
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut WarmupStatus)) {
        if let Some(status) = self.write().get_mut(id) {
            f(status);
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, WarmupStatus>> {
        self.tasks.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, WarmupStatus>> {
        self.tasks.write().unwrap_or_else(|e| e.into_inner())
    }
}
