//! Per-program signature windows persisted across restarts.
//!
//! A window is the inclusive `[from, to]` range of signatures a scanner has
//! processed. `to` only ever moves forward in time and `from` only backward,
//! so dropping intermediate writes is safe — the coalescing layer relies on
//! that to cap persistence at one write per second per program.

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// One end of a window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowBound {
    pub signature: String,
    #[serde(rename = "blockTime")]
    pub block_time: i64,
}

/// Inclusive `[from, to]` signature range; `from` is the oldest processed
/// signature, `to` the newest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureWindow {
    pub from: WindowBound,
    pub to: WindowBound,
}

/// Persistence for scanner windows, keyed by program side (`src` / `dst`).
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, program: &str) -> Result<Option<SignatureWindow>>;
    async fn set(&self, program: &str, window: &SignatureWindow) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

fn checkpoint_key(program: &str) -> String {
    format!("indexer:checkpoint:{program}")
}

/// Redis-backed store; the window is one JSON value per program.
pub struct RedisCheckpointStore {
    con: MultiplexedConnection,
}

impl RedisCheckpointStore {
    pub fn new(con: MultiplexedConnection) -> Self {
        Self { con }
    }
}

#[async_trait]
impl CheckpointStore for RedisCheckpointStore {
    async fn get(&self, program: &str) -> Result<Option<SignatureWindow>> {
        let mut con = self.con.clone();
        let raw: Option<String> = con
            .get(checkpoint_key(program))
            .await
            .context("checkpoint read failed")?;

        Ok(raw.and_then(|raw| match serde_json::from_str(&raw) {
            Ok(window) => Some(window),
            Err(e) => {
                warn!(program, error = %e, "Corrupt checkpoint, starting fresh");
                None
            }
        }))
    }

    async fn set(&self, program: &str, window: &SignatureWindow) -> Result<()> {
        let mut con = self.con.clone();
        let json = serde_json::to_string(window).context("checkpoint serialization failed")?;
        con.set::<_, _, ()>(checkpoint_key(program), json)
            .await
            .context("checkpoint write failed")?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct FlushState {
    last_write: Option<Instant>,
    pending: Option<SignatureWindow>,
}

/// Caps inner-store writes at one per interval per program. The most recent
/// window wins; anything still pending flushes on `close`.
pub struct CoalescedCheckpoints {
    inner: std::sync::Arc<dyn CheckpointStore>,
    min_interval: Duration,
    state: Mutex<HashMap<String, FlushState>>,
}

impl CoalescedCheckpoints {
    pub fn new(inner: std::sync::Arc<dyn CheckpointStore>) -> Self {
        Self::with_interval(inner, Duration::from_secs(1))
    }

    pub fn with_interval(inner: std::sync::Arc<dyn CheckpointStore>, min_interval: Duration) -> Self {
        Self {
            inner,
            min_interval,
            state: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl CheckpointStore for CoalescedCheckpoints {
    async fn get(&self, program: &str) -> Result<Option<SignatureWindow>> {
        {
            let state = self.state.lock().await;
            if let Some(entry) = state.get(program) {
                if let Some(pending) = &entry.pending {
                    return Ok(Some(pending.clone()));
                }
            }
        }
        self.inner.get(program).await
    }

    async fn set(&self, program: &str, window: &SignatureWindow) -> Result<()> {
        let mut state = self.state.lock().await;
        let entry = state.entry(program.to_string()).or_insert(FlushState {
            last_write: None,
            pending: None,
        });

        let due = entry
            .last_write
            .is_none_or(|at| Instant::now().duration_since(at) >= self.min_interval);

        if due {
            self.inner.set(program, window).await?;
            entry.last_write = Some(Instant::now());
            entry.pending = None;
        } else {
            debug!(program, "Coalescing checkpoint write");
            entry.pending = Some(window.clone());
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        for (program, entry) in state.iter_mut() {
            if let Some(window) = entry.pending.take() {
                self.inner.set(program, &window).await?;
            }
        }
        drop(state);
        self.inner.close().await
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Arc;

    /// In-memory checkpoint store recording every persisted window.
    #[derive(Default)]
    pub struct MemoryCheckpoints {
        pub writes: std::sync::Mutex<Vec<(String, SignatureWindow)>>,
    }

    impl MemoryCheckpoints {
        pub fn shared() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn write_count(&self) -> usize {
            self.writes.lock().unwrap().len()
        }

        pub fn last_window(&self, program: &str) -> Option<SignatureWindow> {
            self.writes
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(p, _)| p == program)
                .map(|(_, w)| w.clone())
        }
    }

    #[async_trait]
    impl CheckpointStore for MemoryCheckpoints {
        async fn get(&self, program: &str) -> Result<Option<SignatureWindow>> {
            Ok(self.last_window(program))
        }

        async fn set(&self, program: &str, window: &SignatureWindow) -> Result<()> {
            self.writes
                .lock()
                .unwrap()
                .push((program.to_string(), window.clone()));
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }
}
