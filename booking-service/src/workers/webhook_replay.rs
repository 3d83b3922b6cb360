//! Periodic re-drive of webhook events that were stored but never applied.

use crate::services::payments::PaymentEngine;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct WebhookReplayWorker {
    engine: PaymentEngine,
    shutdown_token: CancellationToken,
}

impl WebhookReplayWorker {
    pub fn new(engine: PaymentEngine) -> Self {
        Self {
            engine,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Token that stops the loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Spawn the replay loop. Returns `None` when replay is disabled.
    pub fn start(self) -> Option<JoinHandle<()>> {
        let config = self.engine.replay_config().clone();
        if !config.enabled {
            tracing::info!("Webhook replay disabled by configuration");
            return None;
        }

        tracing::info!(
            interval_secs = config.interval_secs,
            batch_size = config.batch_size,
            max_attempts = config.max_attempts,
            "Starting webhook replay worker"
        );

        let shutdown = self.shutdown_token.clone();
        let engine = self.engine;

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Webhook replay worker shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = engine.replay_pending_webhooks(config.batch_size).await {
                            tracing::error!(error = %e, "Webhook replay pass failed");
                        }
                    }
                }
            }
        }))
    }
}
