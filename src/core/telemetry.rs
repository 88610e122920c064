//! Usage telemetry sink.
//!
//! The proxy only depends on the [`TelemetrySink`] contract: `ingest` a list
//! of records into a dataset, then `flush`. [`AxiomSink`] is the production
//! implementation; it hands records to a background worker which batches
//! them per dataset and ships them to the Axiom ingest API.

use crate::core::config::TelemetryConfig;
use crate::core::error::TelemetryError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Capacity of the queue between request tasks and the sink worker.
const QUEUE_CAPACITY: usize = 1000;

/// Destination for aggregated usage records.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Queue `records` for delivery into `dataset`.
    async fn ingest(&self, dataset: &str, records: Vec<Value>) -> Result<(), TelemetryError>;

    /// Deliver everything queued so far.
    async fn flush(&self) -> Result<(), TelemetryError>;
}

/// Message sent to the background worker.
enum SinkEvent {
    Ingest {
        dataset: String,
        records: Vec<Value>,
    },
    Flush(oneshot::Sender<Result<(), TelemetryError>>),
    Shutdown(oneshot::Sender<()>),
}

/// Axiom-backed telemetry sink.
#[derive(Clone)]
pub struct AxiomSink {
    sender: mpsc::Sender<SinkEvent>,
}

impl AxiomSink {
    /// Start the background worker and return a handle to it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(config: &TelemetryConfig, client: Client) -> Self {
        let (sender, receiver) = mpsc::channel::<SinkEvent>(QUEUE_CAPACITY);

        let worker = AxiomWorker {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            token: config.token.clone().unwrap_or_default(),
            org_id: config.org_id.clone().unwrap_or_default(),
            pending: HashMap::new(),
        };
        let flush_interval = Duration::from_secs(config.flush_interval_secs.max(1));
        tokio::spawn(worker.run(receiver, flush_interval));

        tracing::info!(url = %config.url, dataset = %config.dataset, "Axiom telemetry sink started");
        Self { sender }
    }

    /// Flush pending records and stop the worker.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(SinkEvent::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
        tracing::info!("Axiom telemetry sink shutdown complete");
    }
}

#[async_trait]
impl TelemetrySink for AxiomSink {
    async fn ingest(&self, dataset: &str, records: Vec<Value>) -> Result<(), TelemetryError> {
        self.sender
            .try_send(SinkEvent::Ingest {
                dataset: dataset.to_string(),
                records,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => TelemetryError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => TelemetryError::Closed,
            })
    }

    async fn flush(&self) -> Result<(), TelemetryError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SinkEvent::Flush(tx))
            .await
            .map_err(|_| TelemetryError::Closed)?;
        rx.await.map_err(|_| TelemetryError::Closed)?
    }
}

struct AxiomWorker {
    client: Client,
    base_url: String,
    token: String,
    org_id: String,
    /// Records waiting for delivery, keyed by dataset
    pending: HashMap<String, Vec<Value>>,
}

impl AxiomWorker {
    async fn run(mut self, mut receiver: mpsc::Receiver<SinkEvent>, flush_interval: Duration) {
        let mut flush_timer = tokio::time::interval(flush_interval);

        loop {
            tokio::select! {
                event = receiver.recv() => {
                    match event {
                        Some(SinkEvent::Ingest { dataset, records }) => {
                            self.pending.entry(dataset).or_default().extend(records);
                        }
                        Some(SinkEvent::Flush(reply)) => {
                            let result = self.send_pending().await;
                            let _ = reply.send(result);
                        }
                        Some(SinkEvent::Shutdown(reply)) => {
                            let _ = self.send_pending().await;
                            let _ = reply.send(());
                            break;
                        }
                        None => {
                            let _ = self.send_pending().await;
                            break;
                        }
                    }
                }
                _ = flush_timer.tick() => {
                    let _ = self.send_pending().await;
                }
            }
        }

        tracing::debug!("Axiom telemetry worker shutdown");
    }

    /// Deliver every pending batch. Failed batches are dropped, the first
    /// failure is reported.
    async fn send_pending(&mut self) -> Result<(), TelemetryError> {
        let mut first_error = None;
        for (dataset, records) in self.pending.drain().collect::<Vec<_>>() {
            if records.is_empty() {
                continue;
            }
            let count = records.len();
            match self.send_batch(&dataset, &records).await {
                Ok(()) => {
                    tracing::debug!(dataset = %dataset, count, "Telemetry batch delivered");
                }
                Err(e) => {
                    tracing::warn!(dataset = %dataset, count, error = %e, "Dropping telemetry batch");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn send_batch(&self, dataset: &str, records: &[Value]) -> Result<(), TelemetryError> {
        let url = format!("{}/v1/datasets/{}/ingest", self.base_url, dataset);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .header("X-Axiom-Org-Id", &self.org_id)
            .json(records)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TelemetryError::Rejected {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            })
        }
    }
}
