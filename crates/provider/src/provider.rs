//! The uniform contract every configuration source implements.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use fluxgate_core::{ConfigMessage, INTERNAL_PROVIDER};

use crate::error::ProviderError;

/// Initial retry delay after a failed `provide` call.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
/// Retry delays double per failure up to this cap.
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Strongly-typed provider trait with native `async fn`.
///
/// This trait is **not** object-safe because it uses native `async fn`
/// methods. For dynamic dispatch use [`DynProvider`]; every `Provider`
/// implements it via a blanket implementation.
pub trait Provider: Send + Sync {
    /// The stable provider id, used as the `@provider` qualifier.
    fn name(&self) -> &str;

    /// One-shot initialisation, called before [`provide`](Self::provide).
    fn init(&self) -> impl Future<Output = Result<(), ProviderError>> + Send {
        async { Ok(()) }
    }

    /// Long-running emission loop. Must send a full [`ConfigMessage`] on
    /// `out` whenever the provider's view changes, and return promptly
    /// when `cancel` fires. Emitting an unchanged payload is harmless;
    /// the aggregator deduplicates.
    fn provide(
        &self,
        out: mpsc::Sender<ConfigMessage>,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<(), ProviderError>> + Send;
}

/// Object-safe provider trait for use behind `Arc<dyn DynProvider>`.
///
/// Implement [`Provider`] instead and rely on the blanket implementation.
#[async_trait]
pub trait DynProvider: Send + Sync {
    /// The stable provider id.
    fn name(&self) -> &str;

    /// One-shot initialisation.
    async fn init(&self) -> Result<(), ProviderError>;

    /// Long-running emission loop.
    async fn provide(
        &self,
        out: mpsc::Sender<ConfigMessage>,
        cancel: CancellationToken,
    ) -> Result<(), ProviderError>;
}

#[async_trait]
impl<T: Provider + Sync> DynProvider for T {
    fn name(&self) -> &str {
        Provider::name(self)
    }

    async fn init(&self) -> Result<(), ProviderError> {
        Provider::init(self).await
    }

    async fn provide(
        &self,
        out: mpsc::Sender<ConfigMessage>,
        cancel: CancellationToken,
    ) -> Result<(), ProviderError> {
        Provider::provide(self, out, cancel).await
    }
}

/// Holds every registered provider and owns their emission tasks.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn DynProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider. Names must be unique and must not use the
    /// reserved `internal` id.
    pub fn register(&mut self, provider: Arc<dyn DynProvider>) -> Result<(), ProviderError> {
        let name = provider.name().to_owned();
        if name == INTERNAL_PROVIDER {
            return Err(ProviderError::InvalidName(name, "reserved provider id"));
        }
        if name.is_empty() {
            return Err(ProviderError::InvalidName(name, "empty provider id"));
        }
        if self.providers.iter().any(|p| p.name() == name) {
            return Err(ProviderError::InvalidName(name, "duplicate provider id"));
        }
        self.providers.push(provider);
        Ok(())
    }

    /// Registered provider names, in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Initialise every provider and spawn its emission loop on `tracker`.
    ///
    /// A provider whose `init` fails is skipped with a warning; the rest of
    /// the fleet starts normally. A failing `provide` is retried with
    /// exponential backoff until `cancel` fires; the provider's previous
    /// payload stays effective in the aggregator meanwhile.
    pub async fn launch(
        &self,
        out: mpsc::Sender<ConfigMessage>,
        tracker: &TaskTracker,
        cancel: CancellationToken,
    ) {
        for provider in &self.providers {
            let name = provider.name().to_owned();
            if let Err(e) = provider.init().await {
                warn!(provider = %name, error = %e, "provider init failed, skipping");
                continue;
            }
            info!(provider = %name, "provider started");

            let provider = Arc::clone(provider);
            let out = out.clone();
            let cancel = cancel.clone();
            tracker.spawn(async move {
                let mut backoff = BACKOFF_INITIAL;
                loop {
                    match provider.provide(out.clone(), cancel.clone()).await {
                        Ok(()) => break,
                        Err(e) => {
                            warn!(provider = %provider.name(), error = %e, retry_in = ?backoff,
                                "provider stream failed, retrying");
                        }
                    }
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluxgate_core::DynamicConfig;

    struct NullProvider {
        id: String,
    }

    impl Provider for NullProvider {
        fn name(&self) -> &str {
            &self.id
        }

        async fn provide(
            &self,
            out: mpsc::Sender<ConfigMessage>,
            cancel: CancellationToken,
        ) -> Result<(), ProviderError> {
            let _ = out
                .send(ConfigMessage::new(self.id.as_str(), DynamicConfig::default()))
                .await;
            cancel.cancelled().await;
            Ok(())
        }
    }

    #[test]
    fn reserved_and_duplicate_names_rejected() {
        let mut registry = ProviderRegistry::new();
        let err = registry
            .register(Arc::new(NullProvider {
                id: "internal".to_owned(),
            }))
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidName(..)));

        registry
            .register(Arc::new(NullProvider {
                id: "file".to_owned(),
            }))
            .unwrap();
        let err = registry
            .register(Arc::new(NullProvider {
                id: "file".to_owned(),
            }))
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidName(..)));
    }

    #[tokio::test]
    async fn launch_emits_and_stops_on_cancel() {
        let mut registry = ProviderRegistry::new();
        registry
            .register(Arc::new(NullProvider {
                id: "file".to_owned(),
            }))
            .unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        registry.launch(tx, &tracker, cancel.clone()).await;

        let msg = rx.recv().await.expect("one message");
        assert_eq!(msg.provider.as_str(), "file");

        cancel.cancel();
        tracker.close();
        tracker.wait().await;
    }
}
