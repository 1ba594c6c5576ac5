use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, trace};

use super::resolver::GeoResolver;
use crate::types::GeoRecord;

/// Resolved batch forwarded to whoever displays geo data.
pub type GeoBatch = HashMap<String, GeoRecord>;

/// Cheap handle the scanner uses to queue reachable IPs for lookup.
#[derive(Debug, Clone)]
pub struct GeoNotifier {
    tx: mpsc::Sender<String>,
}

impl GeoNotifier {
    /// Queue `ip` without waiting. Dropped when the queue is full or the batcher is gone.
    pub fn notify(&self, ip: &str) {
        match self.tx.try_send(ip.to_string()) {
            Ok(()) => {}
            Err(TrySendError::Full(ip)) => debug!(%ip, "geo queue full, dropping"),
            Err(TrySendError::Closed(ip)) => trace!(%ip, "geo queue closed"),
        }
    }
}

/// Bounded queue between scanner and resolver.
pub fn geo_channel(capacity: usize) -> (GeoNotifier, mpsc::Receiver<String>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (GeoNotifier { tx }, rx)
}

/// Drain `rx` in batches and resolve them.
///
/// A batch opens on the first queued IP and closes after `window` or at `max_batch` distinct
/// IPs, whichever comes first. The task ends once every notifier is dropped and the queue is
/// drained.
pub fn spawn_geo_batcher(
    resolver: Arc<GeoResolver>,
    mut rx: mpsc::Receiver<String>,
    window: Duration,
    max_batch: usize,
    out: Option<mpsc::UnboundedSender<GeoBatch>>,
) -> JoinHandle<()> {
    let max_batch = max_batch.max(1);
    tokio::spawn(async move {
        while let Some(first) = rx.recv().await {
            let mut seen = HashSet::from([first.clone()]);
            let mut batch = vec![first];
            let deadline = Instant::now() + window;
            let mut closed = false;

            while batch.len() < max_batch {
                match time::timeout_at(deadline, rx.recv()).await {
                    Ok(Some(ip)) => {
                        if seen.insert(ip.clone()) {
                            batch.push(ip);
                        }
                    }
                    Ok(None) => {
                        closed = true;
                        break;
                    }
                    Err(_) => break,
                }
            }

            debug!(count = batch.len(), "geo batch flushing");
            let resolved = resolver.resolve(&batch).await;
            if let Some(out) = &out {
                let _ = out.send(resolved);
            }
            if closed {
                break;
            }
        }
    })
}
