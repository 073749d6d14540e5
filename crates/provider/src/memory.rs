//! Push-based in-memory provider.
//!
//! Used by the process itself (internal entities) and by tests; the
//! concrete external providers (file watcher, KV adapters, orchestrator
//! clients) live outside this repository and implement the same port.

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use fluxgate_core::{ConfigMessage, DynamicConfig};

use crate::error::ProviderError;
use crate::provider::Provider;

/// A provider whose view is pushed through a [`MemoryHandle`].
pub struct MemoryProvider {
    id: String,
    initial: Option<DynamicConfig>,
    updates: Mutex<Option<mpsc::Receiver<DynamicConfig>>>,
}

/// Pushes configuration updates into a [`MemoryProvider`].
#[derive(Clone)]
pub struct MemoryHandle {
    tx: mpsc::Sender<DynamicConfig>,
}

impl MemoryHandle {
    /// Replace the provider's view. Returns `false` once the provider has
    /// stopped.
    pub async fn push(&self, config: DynamicConfig) -> bool {
        self.tx.send(config).await.is_ok()
    }
}

impl MemoryProvider {
    /// Create a provider that emits `initial` on start and every pushed
    /// update afterwards.
    pub fn new(id: impl Into<String>, initial: Option<DynamicConfig>) -> (Self, MemoryHandle) {
        let (tx, rx) = mpsc::channel(16);
        (
            Self {
                id: id.into(),
                initial,
                updates: Mutex::new(Some(rx)),
            },
            MemoryHandle { tx },
        )
    }
}

impl Provider for MemoryProvider {
    fn name(&self) -> &str {
        &self.id
    }

    async fn provide(
        &self,
        out: mpsc::Sender<ConfigMessage>,
        cancel: CancellationToken,
    ) -> Result<(), ProviderError> {
        let Some(mut updates) = self.updates.lock().take() else {
            return Err(ProviderError::Transport(
                "memory provider already running".to_owned(),
            ));
        };

        if let Some(initial) = self.initial.clone() {
            let _ = out.send(ConfigMessage::new(self.id.as_str(), initial)).await;
        }

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                update = updates.recv() => match update {
                    Some(config) => {
                        if out
                            .send(ConfigMessage::new(self.id.as_str(), config))
                            .await
                            .is_err()
                        {
                            return Ok(());
                        }
                    }
                    None => return Ok(()),
                },
            }
        }
    }
}
