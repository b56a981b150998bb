//! Durable processing ledger and business record store.
//!
//! One sled database with a tree per record kind: the processed-event
//! ledger driving idempotency, the submitted-transaction audit trail, the
//! moderation verdicts, and the per-spot summary generations. Records are
//! bincode-serialized.
//!
//! The claim operation is an atomic insert-if-absent via compare-and-swap,
//! so even concurrent duplicate delivery of one event id yields exactly one
//! claim winner. Opening the database also takes sled's single-process
//! lock, which enforces the one-instance deployment assumption.

use bincode::{
    deserialize as de,
    serialize as ser,
};
use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
    de::DeserializeOwned,
};
use std::{
    path::Path,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
    },
};

use crate::events::ChainEvent;

const PROCESSED_EVENTS_TREE: &str = "processed_events";
const ORACLE_TX_TREE: &str = "oracle_transactions";
const REVIEW_AUDIT_TREE: &str = "review_audits";
const SUMMARY_TREE: &str = "summary_generations";

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Ledger store error")]
    Sled(#[source] std::io::Error),
    #[error("Record encoding error")]
    Bincode(#[source] bincode::Error),
    #[error("Payload encoding error")]
    Json(#[source] serde_json::Error),
}

pub type LedgerResult<T = ()> = Result<T, LedgerError>;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Processing state of one event id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingStatus {
    Processing,
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedEventRecord {
    pub event_id: String,
    pub event_type: String,
    pub transaction_hash: String,
    pub block_number: u64,
    /// JSON rendering of the decoded event arguments.
    pub payload: String,
    pub status: ProcessingStatus,
    pub result: Option<String>,
    pub processed_at: DateTime<Utc>,
}

/// Status of a transaction the oracle submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    Submitted,
    Confirmed,
    Reverted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleTxRecord {
    pub tx_hash: String,
    pub event_id: String,
    pub function: String,
    pub args: String,
    pub status: TxStatus,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewAuditRecord {
    pub review_id: String,
    pub scenic_id: String,
    pub user: String,
    pub content: String,
    pub rating: u8,
    pub is_approved: bool,
    pub reason: String,
    pub audited_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub scenic_id: String,
    /// Per-spot version counter, strictly increasing across generations.
    pub version: u64,
    pub content: String,
    pub generated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct EventLedger {
    /// sled's 1.0-alpha handles are `Send` but not `Sync`, so every access
    /// goes through one lock to let the ledger be shared across tasks.
    inner: Arc<Mutex<LedgerInner>>,
}

struct LedgerInner {
    db: sled::Db,
    processed: sled::Tree,
    transactions: sled::Tree,
    audits: sled::Tree,
    summaries: sled::Tree,
}

impl EventLedger {
    /// Open (or create) the ledger at the given path.
    pub fn open(path: &Path, cache_capacity_bytes: usize) -> LedgerResult<Self> {
        let db = sled::Config::new()
            .path(path)
            .cache_capacity_bytes(cache_capacity_bytes)
            .open()
            .map_err(LedgerError::Sled)?;
        Self::with_db(db)
    }

    /// Ledger backed by a temporary database, removed on drop.
    pub fn temporary() -> LedgerResult<Self> {
        let db = sled::Config::tmp()
            .map_err(LedgerError::Sled)?
            .open()
            .map_err(LedgerError::Sled)?;
        Self::with_db(db)
    }

    fn with_db(db: sled::Db) -> LedgerResult<Self> {
        let processed = db.open_tree(PROCESSED_EVENTS_TREE).map_err(LedgerError::Sled)?;
        let transactions = db.open_tree(ORACLE_TX_TREE).map_err(LedgerError::Sled)?;
        let audits = db.open_tree(REVIEW_AUDIT_TREE).map_err(LedgerError::Sled)?;
        let summaries = db.open_tree(SUMMARY_TREE).map_err(LedgerError::Sled)?;

        Ok(Self {
            inner: Arc::new(Mutex::new(LedgerInner {
                db,
                processed,
                transactions,
                audits,
                summaries,
            })),
        })
    }

    fn inner(&self) -> MutexGuard<'_, LedgerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Flush all trees to disk. Called on shutdown.
    pub fn flush(&self) -> LedgerResult {
        self.inner().db.flush().map_err(LedgerError::Sled)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Processed-event ledger
    // -----------------------------------------------------------------------

    /// Whether any record exists for the event id. A record in any state
    /// blocks redelivery: terminal states are never re-run, and a claim left
    /// behind by a crashed run is skipped rather than re-executed since the
    /// chain writes it may have issued are not idempotent.
    pub fn is_processed(&self, event_id: &str) -> LedgerResult<bool> {
        self.inner()
            .processed
            .contains_key(event_id.as_bytes())
            .map_err(LedgerError::Sled)
    }

    /// Atomically claim the event for processing. Returns false without
    /// writing when any record for the id already exists.
    pub fn claim(&self, event: &ChainEvent) -> LedgerResult<bool> {
        let event_id = event.event_id();
        let record = ProcessedEventRecord {
            event_id: event_id.clone(),
            event_type: event.kind.name().to_string(),
            transaction_hash: hex::encode(event.transaction_hash),
            block_number: event.block_number,
            payload: serde_json::to_string(&event.payload).map_err(LedgerError::Json)?,
            status: ProcessingStatus::Processing,
            result: None,
            processed_at: Utc::now(),
        };
        let serialized = ser(&record).map_err(LedgerError::Bincode)?;

        let result =
            self.inner()
                .processed
                .compare_and_swap(event_id.as_bytes(), None::<&[u8]>, Some(serialized));
        match result {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(_)) => Ok(false),
            Err(e) => Err(LedgerError::Sled(e)),
        }
    }

    /// Write the terminal status for the event, replacing the claim record.
    pub fn complete(
        &self,
        event: &ChainEvent,
        status: ProcessingStatus,
        result: &str,
    ) -> LedgerResult {
        let record = ProcessedEventRecord {
            event_id: event.event_id(),
            event_type: event.kind.name().to_string(),
            transaction_hash: hex::encode(event.transaction_hash),
            block_number: event.block_number,
            payload: serde_json::to_string(&event.payload).map_err(LedgerError::Json)?,
            status,
            result: Some(result.to_string()),
            processed_at: Utc::now(),
        };

        self.inner()
            .processed
            .insert(
                record.event_id.as_bytes(),
                ser(&record).map_err(LedgerError::Bincode)?,
            )
            .map_err(LedgerError::Sled)?;
        Ok(())
    }

    pub fn processed_event(&self, event_id: &str) -> LedgerResult<Option<ProcessedEventRecord>> {
        get_record(&self.inner().processed, event_id.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Transaction audit trail
    // -----------------------------------------------------------------------

    /// Append a submitted transaction to the audit trail.
    pub fn record_submitted_tx(
        &self,
        tx_hash: &str,
        event_id: &str,
        function: &str,
        args: &str,
    ) -> LedgerResult {
        let record = OracleTxRecord {
            tx_hash: tx_hash.to_string(),
            event_id: event_id.to_string(),
            function: function.to_string(),
            args: args.to_string(),
            status: TxStatus::Submitted,
            created_at: Utc::now(),
            confirmed_at: None,
        };

        self.inner()
            .transactions
            .insert(tx_hash.as_bytes(), ser(&record).map_err(LedgerError::Bincode)?)
            .map_err(LedgerError::Sled)?;
        Ok(())
    }

    /// Move a submitted transaction to its receipt outcome.
    pub fn record_tx_outcome(&self, tx_hash: &str, status: TxStatus) -> LedgerResult {
        let inner = self.inner();
        let Some(mut record) = get_record::<OracleTxRecord>(&inner.transactions, tx_hash.as_bytes())?
        else {
            return Ok(());
        };

        record.status = status;
        record.confirmed_at = Some(Utc::now());
        inner
            .transactions
            .insert(tx_hash.as_bytes(), ser(&record).map_err(LedgerError::Bincode)?)
            .map_err(LedgerError::Sled)?;
        Ok(())
    }

    pub fn oracle_tx(&self, tx_hash: &str) -> LedgerResult<Option<OracleTxRecord>> {
        get_record(&self.inner().transactions, tx_hash.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Business records
    // -----------------------------------------------------------------------

    pub fn save_review_audit(&self, record: &ReviewAuditRecord) -> LedgerResult {
        self.inner()
            .audits
            .insert(
                record.review_id.as_bytes(),
                ser(record).map_err(LedgerError::Bincode)?,
            )
            .map_err(LedgerError::Sled)?;
        Ok(())
    }

    pub fn review_audit(&self, review_id: &str) -> LedgerResult<Option<ReviewAuditRecord>> {
        get_record(&self.inner().audits, review_id.as_bytes())
    }

    pub fn save_summary(&self, record: &SummaryRecord) -> LedgerResult {
        self.inner()
            .summaries
            .insert(
                record.scenic_id.as_bytes(),
                ser(record).map_err(LedgerError::Bincode)?,
            )
            .map_err(LedgerError::Sled)?;
        Ok(())
    }

    /// Latest generated summary for the spot, if any.
    pub fn last_summary(&self, scenic_id: &str) -> LedgerResult<Option<SummaryRecord>> {
        get_record(&self.inner().summaries, scenic_id.as_bytes())
    }
}

fn get_record<T: DeserializeOwned>(tree: &sled::Tree, key: &[u8]) -> LedgerResult<Option<T>> {
    tree.get(key)
        .map_err(LedgerError::Sled)?
        .map(|bytes| de(&bytes).map_err(LedgerError::Bincode))
        .transpose()
}
