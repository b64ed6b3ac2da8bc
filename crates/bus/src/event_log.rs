//! Append-only record of everything that happened on the bus

use serde::{Deserialize, Serialize};

use ethersim_core::types::serde_secs;
use ethersim_core::{SimTime, StationId, Transmission, TransmissionId};

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Enqueued,
    SendStart,
    Deferred,
    Collision,
    CollisionDetected,
    Backoff,
    Resumed,
    Delivered,
    Failed,
    Cancelled,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LogEntry {
    pub index: usize,
    #[serde(with = "serde_secs")]
    pub at: SimTime,
    pub kind: EventKind,
    pub transmission: Option<TransmissionId>,
    pub sender: StationId,
    pub receiver: StationId,
    pub detail: String,
}

#[derive(Debug, Default)]
pub struct TransmissionLog {
    entries: Vec<LogEntry>,
}

impl TransmissionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        at: SimTime,
        kind: EventKind,
        transmission: Option<TransmissionId>,
        sender: StationId,
        receiver: StationId,
        detail: impl Into<String>,
    ) -> &LogEntry {
        let index = self.entries.len();
        self.entries.push(LogEntry {
            index,
            at,
            kind,
            transmission,
            sender,
            receiver,
            detail: detail.into(),
        });
        &self.entries[index]
    }

    pub fn record_for(
        &mut self,
        at: SimTime,
        kind: EventKind,
        t: &Transmission,
        detail: impl Into<String>,
    ) -> &LogEntry {
        self.record(at, kind, Some(t.id), t.sender, t.receiver, detail)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Entries appended at or after `index`.
    pub fn since(&self, index: usize) -> &[LogEntry] {
        &self.entries[index.min(self.entries.len())..]
    }

    pub fn page(&self, offset: usize, limit: usize) -> &[LogEntry] {
        let start = offset.min(self.entries.len());
        let end = offset.saturating_add(limit).min(self.entries.len());
        &self.entries[start..end]
    }

    pub fn for_transmission(&self, id: TransmissionId) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().filter(move |e| e.transmission == Some(id))
    }
}
