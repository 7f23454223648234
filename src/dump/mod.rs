//! Tracker export and import.
//!
//! Exports are gzipped JSON documents. User-authored tickets and comments
//! carry a detached signature so an import back into this service can tell
//! authentic content from tampered content.

mod export;
mod format;
mod import;

pub use export::{build_dump, export_tracker};
pub use format::{
    CommentSignatureData, DumpComment, DumpEvent, DumpLabel, DumpParticipant, DumpTicket,
    DumpTicketRef, DumpUser, TicketSignatureData, TrackerDump, read_dump, write_dump,
};
pub use import::{ImportSummary, import_tracker};

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::participants::ParticipantResolver;
use crate::signature::PayloadSigner;
use crate::store::SqliteStore;

/// Identity of this service as an upstream.
#[derive(Clone)]
pub struct DumpContext {
    pub origin: String,
    pub signer: Arc<dyn PayloadSigner>,
}

impl DumpContext {
    pub fn new(origin: &str, signer: Arc<dyn PayloadSigner>) -> Self {
        Self {
            origin: origin.trim_end_matches('/').to_string(),
            signer,
        }
    }
}

/// Runs an import in the background under `timeout`.
///
/// File-backed stores get a dedicated connection so the import does not hold
/// the request connection. When the deadline passes, the running statement
/// is interrupted and the transaction rolls back. The import flag is cleared
/// on every path.
pub async fn run_import_job(
    store: Arc<SqliteStore>,
    ctx: DumpContext,
    resolver: ParticipantResolver,
    tracker_id: i64,
    dump: TrackerDump,
    timeout: Duration,
) -> Result<ImportSummary> {
    tracing::info!(tracker = tracker_id, tickets = dump.tickets.len(), "tracker import started");
    let deadline = Instant::now() + timeout;

    let (interrupt, task) = match store.open_dedicated()? {
        Some(mut conn) => {
            let interrupt = conn.get_interrupt_handle();
            let task = tokio::task::spawn_blocking(move || {
                import_tracker(&mut conn, &ctx, &resolver, tracker_id, &dump, Some(deadline))
            });
            (interrupt, task)
        }
        None => {
            let interrupt = store.interrupt_handle();
            let shared = Arc::clone(&store);
            let task = tokio::task::spawn_blocking(move || {
                let mut conn = shared.connection();
                import_tracker(&mut conn, &ctx, &resolver, tracker_id, &dump, Some(deadline))
            });
            (interrupt, task)
        }
    };
    tokio::pin!(task);

    let joined = tokio::select! {
        joined = &mut task => joined,
        () = tokio::time::sleep(timeout) => {
            tracing::warn!(tracker = tracker_id, "tracker import timed out; interrupting");
            interrupt.interrupt();
            // Wait for the rollback and flag reset before reporting.
            let _ = (&mut task).await;
            return Err(Error::Timeout);
        }
    };
    joined.map_err(|e| Error::Batch(format!("import task failed: {e}")))?
}
