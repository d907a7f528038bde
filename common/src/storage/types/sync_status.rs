use std::fmt;

use serde::{Deserialize, Serialize};
use state_machines::state_machine;

use crate::error::AppError;

/// Where a document is in its journey from upload to searchable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Stored under the tenant's prefix, no ingestion job yet.
    Uploaded,
    /// Parked under the pending prefix while the tenant's index is created.
    CreatingIndex,
    /// Moved by the migrator, waiting for the batch ingestion job.
    ReadyForIngestion,
    /// Placed after index creation, ingestion about to start.
    Processing,
    /// An ingestion job has been started for this document.
    Syncing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    DeferToIndex,
    IndexReady,
    Migrate,
    StartSync,
    Complete,
    Fail,
}

impl SyncStatus {
    pub const ALL: [SyncStatus; 7] = [
        SyncStatus::Uploaded,
        SyncStatus::CreatingIndex,
        SyncStatus::ReadyForIngestion,
        SyncStatus::Processing,
        SyncStatus::Syncing,
        SyncStatus::Completed,
        SyncStatus::Failed,
    ];

    /// States in which an ingestion job may be running for the document.
    pub const IN_FLIGHT: [SyncStatus; 2] = [SyncStatus::Processing, SyncStatus::Syncing];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Uploaded => "uploaded",
            SyncStatus::CreatingIndex => "creating_index",
            SyncStatus::ReadyForIngestion => "ready_for_ingestion",
            SyncStatus::Processing => "processing",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncStatus::Completed | SyncStatus::Failed)
    }

    /// States a document record may be created in.
    pub fn is_entry_state(&self) -> bool {
        matches!(self, SyncStatus::Uploaded | SyncStatus::CreatingIndex)
    }

    /// The status reached by applying `event`, or `InvalidTransition`.
    pub fn apply(self, event: SyncEvent) -> Result<SyncStatus, AppError> {
        compute_next_status(self, event)
    }

    /// Every status from which `event` is legal.
    pub fn sources_for(event: SyncEvent) -> Vec<SyncStatus> {
        SyncStatus::ALL
            .into_iter()
            .filter(|status| status.apply(event).is_ok())
            .collect()
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SyncEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncEvent::DeferToIndex => "defer_to_index",
            SyncEvent::IndexReady => "index_ready",
            SyncEvent::Migrate => "migrate",
            SyncEvent::StartSync => "start_sync",
            SyncEvent::Complete => "complete",
            SyncEvent::Fail => "fail",
        }
    }
}

mod lifecycle {
    use super::state_machine;

    state_machine! {
        name: DocumentSyncMachine,
        initial: Uploaded,
        states: [Uploaded, CreatingIndex, ReadyForIngestion, Processing, Syncing, Completed, Failed],
        events {
            defer_to_index {
                transition: { from: Uploaded, to: CreatingIndex }
            }
            index_ready {
                transition: { from: CreatingIndex, to: Processing }
            }
            migrate {
                transition: { from: CreatingIndex, to: ReadyForIngestion }
            }
            start_sync {
                transition: { from: Uploaded, to: Syncing }
                transition: { from: ReadyForIngestion, to: Syncing }
                transition: { from: Processing, to: Syncing }
            }
            complete {
                transition: { from: Processing, to: Completed }
                transition: { from: Syncing, to: Completed }
            }
            fail {
                transition: { from: Uploaded, to: Failed }
                transition: { from: CreatingIndex, to: Failed }
                transition: { from: ReadyForIngestion, to: Failed }
                transition: { from: Processing, to: Failed }
                transition: { from: Syncing, to: Failed }
            }
        }
    }

    pub(super) fn uploaded() -> DocumentSyncMachine<(), Uploaded> {
        DocumentSyncMachine::new(())
    }

    pub(super) fn creating_index() -> Option<DocumentSyncMachine<(), CreatingIndex>> {
        uploaded().defer_to_index().ok()
    }

    pub(super) fn ready_for_ingestion() -> Option<DocumentSyncMachine<(), ReadyForIngestion>> {
        creating_index()?.migrate().ok()
    }

    pub(super) fn processing() -> Option<DocumentSyncMachine<(), Processing>> {
        creating_index()?.index_ready().ok()
    }

    pub(super) fn syncing() -> Option<DocumentSyncMachine<(), Syncing>> {
        uploaded().start_sync().ok()
    }
}

fn invalid_transition(status: SyncStatus, event: SyncEvent) -> AppError {
    AppError::InvalidTransition(format!(
        "document sync status {} does not accept {}",
        status.as_str(),
        event.as_str()
    ))
}

fn compute_next_status(status: SyncStatus, event: SyncEvent) -> Result<SyncStatus, AppError> {
    use lifecycle::*;
    let next = match (status, event) {
        (SyncStatus::Uploaded, SyncEvent::DeferToIndex) => uploaded()
            .defer_to_index()
            .ok()
            .map(|_| SyncStatus::CreatingIndex),
        (SyncStatus::CreatingIndex, SyncEvent::IndexReady) => creating_index()
            .and_then(|m| m.index_ready().ok())
            .map(|_| SyncStatus::Processing),
        (SyncStatus::CreatingIndex, SyncEvent::Migrate) => creating_index()
            .and_then(|m| m.migrate().ok())
            .map(|_| SyncStatus::ReadyForIngestion),
        (SyncStatus::Uploaded, SyncEvent::StartSync) => uploaded()
            .start_sync()
            .ok()
            .map(|_| SyncStatus::Syncing),
        (SyncStatus::ReadyForIngestion, SyncEvent::StartSync) => ready_for_ingestion()
            .and_then(|m| m.start_sync().ok())
            .map(|_| SyncStatus::Syncing),
        (SyncStatus::Processing, SyncEvent::StartSync) => processing()
            .and_then(|m| m.start_sync().ok())
            .map(|_| SyncStatus::Syncing),
        (SyncStatus::Processing, SyncEvent::Complete) => processing()
            .and_then(|m| m.complete().ok())
            .map(|_| SyncStatus::Completed),
        (SyncStatus::Syncing, SyncEvent::Complete) => syncing()
            .and_then(|m| m.complete().ok())
            .map(|_| SyncStatus::Completed),
        (SyncStatus::Uploaded, SyncEvent::Fail) => {
            uploaded().fail().ok().map(|_| SyncStatus::Failed)
        }
        (SyncStatus::CreatingIndex, SyncEvent::Fail) => creating_index()
            .and_then(|m| m.fail().ok())
            .map(|_| SyncStatus::Failed),
        (SyncStatus::ReadyForIngestion, SyncEvent::Fail) => ready_for_ingestion()
            .and_then(|m| m.fail().ok())
            .map(|_| SyncStatus::Failed),
        (SyncStatus::Processing, SyncEvent::Fail) => processing()
            .and_then(|m| m.fail().ok())
            .map(|_| SyncStatus::Failed),
        (SyncStatus::Syncing, SyncEvent::Fail) => syncing()
            .and_then(|m| m.fail().ok())
            .map(|_| SyncStatus::Failed),
        _ => None,
    };

    next.ok_or_else(|| invalid_transition(status, event))
}
