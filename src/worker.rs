// src/worker.rs
//! Worker pool: a feeder polls for pending messages and hands them to N
//! workers over a bounded queue.
//!
//! Shutdown is cooperative. Workers stop taking new messages and abandon the
//! current one between chunks; abandoned messages stay pending.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::gauge;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::pipeline::WorkerSection;
use crate::message::{MessageId, ParseStatus};
use crate::pipeline::{Pipeline, ProcessOutcome};

type InFlight = Arc<Mutex<HashSet<MessageId>>>;

pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

fn release(in_flight: &InFlight, id: &MessageId) {
    let mut set = in_flight.lock().unwrap_or_else(|e| e.into_inner());
    set.remove(id);
    gauge!("worker_in_flight").set(set.len() as f64);
}

impl WorkerPool {
    pub fn spawn(pipeline: Arc<Pipeline>, cfg: &WorkerSection) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tx, rx) = mpsc::channel::<MessageId>(cfg.queue_depth.max(1));
        let rx = Arc::new(AsyncMutex::new(rx));
        let in_flight: InFlight = Arc::new(Mutex::new(HashSet::new()));

        let mut handles = Vec::with_capacity(cfg.count + 1);
        handles.push(tokio::spawn(feeder(
            pipeline.clone(),
            tx,
            in_flight.clone(),
            shutdown_rx.clone(),
            Duration::from_millis(cfg.poll_interval_ms.max(10)),
            cfg.queue_depth.max(1),
        )));
        for n in 0..cfg.count.max(1) {
            handles.push(tokio::spawn(worker(
                n,
                pipeline.clone(),
                rx.clone(),
                in_flight.clone(),
                shutdown_rx.clone(),
            )));
        }
        info!(workers = cfg.count.max(1), "worker pool started");
        Self {
            shutdown: shutdown_tx,
            handles,
        }
    }

    /// Signal shutdown and wait for every task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for h in self.handles {
            if let Err(e) = h.await {
                error!(error = %e, "worker task failed");
            }
        }
        info!("worker pool stopped");
    }
}

async fn feeder(
    pipeline: Arc<Pipeline>,
    tx: mpsc::Sender<MessageId>,
    in_flight: InFlight,
    mut shutdown: watch::Receiver<bool>,
    poll: Duration,
    batch: usize,
) {
    let mut ticker = tokio::time::interval(poll);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        if *shutdown.borrow() {
            break;
        }

        let pending = match pipeline
            .store()
            .messages_by_status(ParseStatus::Pending, batch)
            .await
        {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "polling pending messages failed");
                continue;
            }
        };

        for message in pending {
            let claimed = {
                let mut set = in_flight.lock().unwrap_or_else(|e| e.into_inner());
                let fresh = set.insert(message.id.clone());
                gauge!("worker_in_flight").set(set.len() as f64);
                fresh
            };
            if !claimed {
                continue;
            }
            let id = message.id.clone();
            tokio::select! {
                _ = shutdown.changed() => {
                    release(&in_flight, &id);
                    return;
                }
                sent = tx.send(message.id) => {
                    if sent.is_err() {
                        release(&in_flight, &id);
                        return;
                    }
                }
            }
        }
    }
    debug!("feeder stopped");
}

async fn worker(
    n: usize,
    pipeline: Arc<Pipeline>,
    rx: Arc<AsyncMutex<mpsc::Receiver<MessageId>>>,
    in_flight: InFlight,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let next = tokio::select! {
            _ = shutdown.changed() => break,
            id = async { rx.lock().await.recv().await } => id,
        };
        let Some(id) = next else {
            break;
        };

        // reload: the message may have been edited or finished since it was queued
        match pipeline.store().message(&id).await {
            Ok(Some(message)) if message.parse_status == ParseStatus::Pending => {
                match pipeline.process_message_with_cancel(&message, &shutdown).await {
                    Ok(ProcessOutcome::Committed(report)) => {
                        debug!(
                            worker = n,
                            message_id = %id,
                            status = %report.status,
                            "worker committed"
                        );
                    }
                    Ok(ProcessOutcome::Cancelled) => {
                        debug!(worker = n, message_id = %id, "worker cancelled mid-message");
                    }
                    Err(e) => warn!(worker = n, message_id = %id, error = %e, "commit failed"),
                }
            }
            Ok(_) => debug!(worker = n, message_id = %id, "no longer pending"),
            Err(e) => warn!(worker = n, message_id = %id, error = %e, "loading message failed"),
        }
        release(&in_flight, &id);
    }
    debug!(worker = n, "worker stopped");
}
