//! Fan-out of one message to every known peer.
//!
//! Delivery is at-most-once: each peer gets one send attempt with its own
//! addressed copy of the message, and nothing is retried. A failure for one
//! peer never stops the remaining sends. Replicas that miss an edit rely on
//! the merge engine's convergence, not on this layer.

use thiserror::Error;

use crate::protocol::Message;
use crate::transport::{Transport, TransportError};

/// A single failed send inside a broadcast.
#[derive(Debug)]
pub struct SendFailure {
    pub peer: String,
    pub error: TransportError,
}

/// Outcome of one broadcast, covering every peer that was attempted.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: Vec<String>,
    pub failures: Vec<SendFailure>,
}

impl BroadcastReport {
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failures.len()
    }

    /// `true` when every attempted send succeeded (vacuously for no peers).
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed_peers(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.peer.as_str()).collect()
    }

    /// Turn a partial delivery into an error that still carries the report.
    pub fn into_result(self) -> Result<Self, BroadcastError> {
        if self.is_complete() {
            Ok(self)
        } else {
            Err(BroadcastError { report: self })
        }
    }
}

/// Some peers could not be reached. The full report is kept.
#[derive(Debug, Error)]
#[error("Failed to reach {} of {} peers: {}", .report.failures.len(), .report.attempted(), summarize(&.report.failures))]
pub struct BroadcastError {
    pub report: BroadcastReport,
}

fn summarize(failures: &[SendFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.peer, f.error))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Send `template` to each of `peers`, readdressing a fresh copy per peer.
///
/// Sends run sequentially in `peers` order.
pub async fn broadcast<T>(transport: &T, template: &Message, peers: &[String]) -> BroadcastReport
where
    T: Transport + ?Sized,
{
    let mut report = BroadcastReport::default();

    for peer in peers {
        let message = template.readdressed(peer);
        match transport.send(&message, peer).await {
            Ok(()) => report.delivered.push(peer.clone()),
            Err(error) => {
                log::warn!("Send {:?} to {peer} failed: {error}", message.msg_type());
                report.failures.push(SendFailure {
                    peer: peer.clone(),
                    error,
                });
            }
        }
    }

    report
}
