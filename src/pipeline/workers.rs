//! Background workers and their lifecycle.

use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::error::{ErrorKind, PipelineError, SourceError};
use crate::health::Gate;
use crate::ingest::ItemSource;
use crate::pipeline::coordinator::Pipeline;
use crate::pipeline::types::{DispatchResult, Halt};

impl Pipeline {
    /// Reconcile entries abandoned by a previous run, then spawn the
    /// delivery workers and the maintenance task.
    pub async fn start(self: &Arc<Self>) -> Result<(), PipelineError> {
        let requeued = self
            .queue()
            .reconcile_abandoned()
            .await
            .map_err(|e| PipelineError::from_queue("reconcile", e))?;

        for worker in 0..self.config.delivery_workers {
            let this = Arc::clone(self);
            self.track(tokio::spawn(async move { this.delivery_loop(worker).await }));
        }

        let this = Arc::clone(self);
        self.track(tokio::spawn(async move { this.maintenance_loop().await }));

        info!(
            delivery_workers = self.config.delivery_workers,
            requeued, "Pipeline started"
        );
        Ok(())
    }

    /// Spawn `workers` tasks polling `source`. Each fetch is health-gated.
    pub fn spawn_ingestion(self: &Arc<Self>, source: Arc<dyn ItemSource>, workers: usize) {
        for worker in 0..workers {
            let this = Arc::clone(self);
            let source = Arc::clone(&source);
            self.track(tokio::spawn(async move {
                this.ingestion_loop(source, worker).await
            }));
        }
    }

    /// Stop accepting work, wait up to `grace` for workers to finish what
    /// they hold, then abort the rest.
    pub async fn shutdown(&self, grace: Duration) {
        info!(grace_secs = grace.as_secs(), "Shutting down pipeline");
        self.shutdown.cancel();

        let handles = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        match tokio::time::timeout(grace, futures::future::join_all(handles)).await {
            Ok(_) => info!("All pipeline workers stopped"),
            Err(_) => {
                let remaining = aborts.iter().filter(|a| !a.is_finished()).count();
                warn!(remaining, "Grace period elapsed, aborting workers");
                for handle in aborts {
                    handle.abort();
                }
            }
        }
    }

    async fn delivery_loop(self: Arc<Self>, worker: usize) {
        info!(worker, "Delivery worker started");
        let poll = self.config.poll_interval;
        loop {
            let wait = match self.dispatch_once().await {
                Ok(DispatchResult::Delivered { .. } | DispatchResult::Failed { .. }) => None,
                Ok(DispatchResult::Idle | DispatchResult::Paused { .. }) => Some(poll),
                Ok(DispatchResult::Closed) | Err(PipelineError::ShuttingDown) => break,
                Err(e) => {
                    self.note_error(&e);
                    Some(poll)
                }
            };
            if !self.idle(wait).await {
                break;
            }
        }
        info!(worker, "Delivery worker stopped");
    }

    async fn ingestion_loop(self: Arc<Self>, source: Arc<dyn ItemSource>, worker: usize) {
        info!(worker, source = source.name(), "Ingestion worker started");
        let poll = self.config.poll_interval;
        loop {
            let wait = match self.health().check().await {
                Ok(Gate::Paused { .. }) => Some(poll),
                Err(e) => {
                    self.note_error(&PipelineError::from_database("health_check", e));
                    Some(poll)
                }
                Ok(Gate::Open { .. }) => match source.next_batch().await {
                    Ok(Some(batch)) => {
                        let report = self.ingest(batch).await;
                        match report.halted {
                            Some(Halt::ShuttingDown) => break,
                            Some(Halt::Paused { .. }) => Some(poll),
                            None => None,
                        }
                    }
                    Ok(None) => Some(poll),
                    Err(e) => {
                        let kind = match e {
                            SourceError::Malformed { .. } => ErrorKind::Fatal,
                            _ => ErrorKind::Transient,
                        };
                        self.counters.error(kind);
                        warn!(worker, source = source.name(), error = %e, "Source fetch failed");
                        Some(poll)
                    }
                },
            };
            if !self.idle(wait).await {
                break;
            }
        }
        info!(worker, source = source.name(), "Ingestion worker stopped");
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.maintenance_interval);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.run_maintenance().await {
                if matches!(e, PipelineError::ShuttingDown) {
                    break;
                }
                self.counters.error(e.kind());
                error!(error = %e, "Maintenance pass failed");
            }
        }
    }

    /// Sleep for `wait` (if any) unless shutdown comes first. Returns
    /// `false` once the pipeline is shutting down.
    async fn idle(&self, wait: Option<Duration>) -> bool {
        if let Some(wait) = wait {
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        !self.is_shutting_down()
    }
}
