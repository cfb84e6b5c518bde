//! Background poller for poll-mode generations
//!
//! Sweeps `running` records whose tool is poll-mode. Each generation is
//! polled on its own schedule: jittered exponential backoff from the base
//! interval up to the tool's soft timeout, with the hard timeout as the
//! deadline past which the record fails with `BACKEND_TIMEOUT`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::watch;

use conjure_backends::JobStatus;
use conjure_types::{ConjureError, DeliveryMode, GenerationId, GenerationStatus};

use crate::ExecutionEngine;

/// Poller tuning
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Sweep tick
    pub tick: Duration,
    /// First poll happens this long after submission
    pub base_interval: Duration,
    /// Fraction of each interval randomized away
    pub jitter: f64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(500),
            base_interval: Duration::from_secs(2),
            jitter: 0.2,
        }
    }
}

struct PollSchedule {
    attempts: u32,
    next_at: chrono::DateTime<chrono::Utc>,
}

/// Sweeps running poll-mode generations
pub struct Poller {
    engine: Arc<ExecutionEngine>,
    config: PollerConfig,
    schedules: tokio::sync::Mutex<HashMap<GenerationId, PollSchedule>>,
}

impl Poller {
    pub fn new(engine: Arc<ExecutionEngine>, config: PollerConfig) -> Self {
        Self {
            engine,
            config,
            schedules: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// One sweep over the running set. Returns how many polls were issued.
    pub async fn sweep(&self) -> usize {
        let running = match self
            .engine
            .store()
            .query_by_status(GenerationStatus::Running, None)
            .await
        {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(error = %err, "poller could not list running records");
                return 0;
            }
        };

        let mut polled = 0;
        for record in running {
            let Ok(tool) = self.engine.registry().get(&record.tool_id) else {
                continue;
            };
            if tool.delivery_mode != DeliveryMode::Poll {
                continue;
            }
            let Some(job_id) = record.backend_job_id.clone() else {
                continue;
            };

            // Hard deadline beats everything, including the poll schedule.
            let started = record.started_at.unwrap_or(record.queued_at);
            let elapsed_ms = (Utc::now() - started).num_milliseconds().max(0) as u64;
            if elapsed_ms >= tool.timeouts.hard_ms {
                self.forget(&record.id).await;
                let _ = self
                    .engine
                    .fail_from_poll(
                        &record.id,
                        ConjureError::BackendTimeout {
                            tool_id: tool.id.to_string(),
                            elapsed_ms,
                        },
                    )
                    .await;
                continue;
            }

            if !self.due(&record.id).await {
                continue;
            }
            polled += 1;

            let Some(backend) = self.engine.backend_registry().get(&tool.backend.backend) else {
                continue;
            };
            match backend.status(&job_id).await {
                Ok(JobStatus::Running) => {
                    self.reschedule(&record.id, tool.timeouts.soft_ms).await;
                }
                Ok(JobStatus::Succeeded) => {
                    self.forget(&record.id).await;
                    match backend.fetch_result(&job_id).await {
                        Ok(response) => {
                            let _ = self
                                .engine
                                .complete_from_poll(&record.id, &tool, response)
                                .await;
                        }
                        Err(err) => {
                            let _ = self
                                .engine
                                .fail_from_poll(&record.id, err.classify(tool.id.as_str()))
                                .await;
                        }
                    }
                }
                Ok(JobStatus::Failed { message }) => {
                    self.forget(&record.id).await;
                    let _ = self
                        .engine
                        .fail_from_poll(&record.id, ConjureError::backend(message))
                        .await;
                }
                Err(err) => {
                    // Transient poll failure: back off and try again, the
                    // hard deadline bounds the total wait.
                    tracing::debug!(generation = %record.id, error = %err, "status poll failed");
                    self.reschedule(&record.id, tool.timeouts.soft_ms).await;
                }
            }
        }
        polled
    }

    /// Whether this generation's next poll is due. First sight schedules
    /// the initial poll without issuing one.
    async fn due(&self, id: &GenerationId) -> bool {
        let mut schedules = self.schedules.lock().await;
        match schedules.get(id) {
            Some(schedule) => schedule.next_at <= Utc::now(),
            None => {
                schedules.insert(
                    id.clone(),
                    PollSchedule {
                        attempts: 0,
                        next_at: Utc::now()
                            + chrono::Duration::from_std(self.config.base_interval)
                                .unwrap_or_else(|_| chrono::Duration::seconds(2)),
                    },
                );
                false
            }
        }
    }

    async fn reschedule(&self, id: &GenerationId, ceiling_ms: u64) {
        let mut schedules = self.schedules.lock().await;
        let schedule = schedules.entry(id.clone()).or_insert(PollSchedule {
            attempts: 0,
            next_at: Utc::now(),
        });
        schedule.attempts += 1;

        let base_ms = self.config.base_interval.as_millis() as u64;
        let backoff_ms = base_ms
            .saturating_mul(2u64.saturating_pow(schedule.attempts.min(16)))
            .min(ceiling_ms.max(base_ms));
        let jitter_ms = if self.config.jitter > 0.0 {
            rand::thread_rng().gen_range(0..=((backoff_ms as f64 * self.config.jitter) as u64))
        } else {
            0
        };
        schedule.next_at =
            Utc::now() + chrono::Duration::milliseconds((backoff_ms - jitter_ms) as i64);
    }

    async fn forget(&self, id: &GenerationId) {
        self.schedules.lock().await.remove(id);
    }

    /// Poll loop until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.tick) => {
                    self.sweep().await;
                }
                _ = shutdown.changed() => {
                    tracing::info!("poller stopping");
                    return;
                }
            }
        }
    }
}
