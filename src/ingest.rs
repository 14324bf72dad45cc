//! Ingestion entry point shared by every record source

use std::sync::Arc;

use crate::Result;
use crate::types::VehicleStateRecord;

/// Destination for normalized records.
///
/// Both the binary frame server and the upstream client hand every decoded
/// record to an `Ingest` implementation. Returning an error never stops the
/// caller; sources log it and continue with the next record.
#[async_trait::async_trait]
pub trait Ingest: Send + Sync + 'static {
    /// Accept one record.
    ///
    /// May wait briefly when downstream queues are full and then fail with
    /// [`IngestError::Backpressure`](crate::IngestError::Backpressure).
    async fn ingest(&self, record: VehicleStateRecord) -> Result<()>;
}

/// Shared handle used by sources.
pub type SharedIngest = Arc<dyn Ingest>;
