//! Per-operation-type traffic counters.
//!
//! All counters are monotonically increasing for the lifetime of a run.

use sim_types::OperationType;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Sent and received counts per [`OperationType`].
#[derive(Debug, Default)]
pub struct OperationTypeCounter {
    sent: [AtomicU64; OperationType::ALL.len()],
    received: [AtomicU64; OperationType::ALL.len()],
}

impl OperationTypeCounter {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count an outgoing operation.
    pub fn record_sent(&self, op_type: OperationType) {
        self.sent[op_type.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Count an incoming operation.
    pub fn record_received(&self, op_type: OperationType) {
        self.received[op_type.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Operations of this type sent so far.
    pub fn sent(&self, op_type: OperationType) -> u64 {
        self.sent[op_type.index()].load(Ordering::Relaxed)
    }

    /// Operations of this type received so far.
    pub fn received(&self, op_type: OperationType) -> u64 {
        self.received[op_type.index()].load(Ordering::Relaxed)
    }

    /// Table of non-zero counters.
    pub fn statistics(&self) -> String {
        let mut out = String::from("Operation statistics (sent/received):\n");
        for op_type in OperationType::ALL {
            let (sent, received) = (self.sent(op_type), self.received(op_type));
            if sent == 0 && received == 0 {
                continue;
            }
            let _ = writeln!(out, "    {:<18} {:>8} {:>8}", op_type.to_string(), sent, received);
        }
        out
    }

    /// Log [`OperationTypeCounter::statistics`].
    pub fn log_statistics(&self) {
        tracing::info!("{}", self.statistics().trim_end());
    }
}
