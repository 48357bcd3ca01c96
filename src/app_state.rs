use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Semaphore;

use crate::config::ServiceConfig;
use crate::engine::{Cancellation, GenerationError, TextGenerator};
use crate::types::GeneratedSequence;

/// Shared state, built once at ignition and read by every request:
/// - generator: the loaded generation capability
/// - semaphore: at most N generations run at once
/// - max_length / timeout: fixed per-request parameters
pub struct AppState {
    pub generator: Arc<dyn TextGenerator>,
    pub semaphore: Arc<Semaphore>,
    pub max_length: usize,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Error)]
pub enum PredictError {
    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("generation did not finish within {0:?}")]
    TimedOut(Duration),
}

impl AppState {
    pub fn new(generator: Arc<dyn TextGenerator>, config: &ServiceConfig) -> Self {
        let permits = config.max_concurrent_generations.max(1);
        Self {
            generator,
            semaphore: Arc::new(Semaphore::new(permits)),
            max_length: config.max_length,
            timeout: config.generation_timeout(),
        }
    }

    /// Runs one generation under the concurrency gate. The timeout covers
    /// waiting for a permit as well as the generation itself.
    ///
    /// The work runs on its own task and keeps its permit until the
    /// generator returns, so a caller that times out (or goes away) never
    /// frees a slot that is still computing. It does cancel the work, which
    /// then stops at the next token.
    pub async fn predict(&self, text: &str) -> Result<Vec<GeneratedSequence>, PredictError> {
        let start = Instant::now();
        let cancel = Cancellation::default();
        let guard = cancel.guard();

        let semaphore = Arc::clone(&self.semaphore);
        let generator = Arc::clone(&self.generator);
        let max_length = self.max_length;
        let prompt = text.to_owned();
        let worker_cancel = cancel.clone();

        let work = tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| GenerationError::Worker(e.to_string()))?;
            if worker_cancel.is_cancelled() {
                return Err(GenerationError::Cancelled);
            }
            let queued = start.elapsed();

            let result = generator
                .generate(&prompt, max_length, &worker_cancel)
                .await?;
            tracing::info!(
                prompt_chars = prompt.chars().count(),
                queued_ms = queued.as_millis() as u64,
                total_ms = start.elapsed().as_millis() as u64,
                "generation finished"
            );
            Ok::<_, GenerationError>(result)
        });

        let joined = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(joined) => joined,
                Err(_) => {
                    tracing::warn!(timeout_ms = limit.as_millis() as u64, "generation timed out");
                    return Err(PredictError::TimedOut(limit));
                }
            },
            None => work.await,
        };
        guard.disarm();

        let result = joined.map_err(|e| GenerationError::Worker(e.to_string()))??;
        Ok(result)
    }
}
