//! Event workflows.
//!
//! The [`WorkflowEngine`] turns each delivered chain event into its off-chain
//! work and result transactions: moderation for submitted reviews, hash
//! backfills for approvals and generated summaries, and AI summarization for
//! summary requests. Every workflow runs under the ledger's claim/complete
//! protocol, so an event reaches its business steps at most once.
//!
//! Failures inside a workflow are terminal for that event only: they are
//! recorded as a failed completion and never propagate to ingestion. The one
//! exception is the ledger itself; losing it voids the idempotency guarantee
//! and stops the node.

use crate::{
    contract::{
        ContractCall,
        ContractReader,
    },
    events::{
        ChainEvent,
        EventPayload,
    },
    ledger::{
        EventLedger,
        LedgerError,
        ProcessingStatus,
        ReviewAuditRecord,
        SummaryRecord,
    },
    poller::EventSink,
    submitter::Submitter,
};
use ai_client::AiClient;
use alloy::primitives::{
    Address,
    B256,
    U256,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::{
    debug,
    info,
    warn,
};

/// Spot name used when the scenic spot lookup fails.
const UNKNOWN_SCENIC_SPOT: &str = "Unknown Scenic Spot";

/// Moderation request body. Field order is part of the prompt contract.
#[derive(Serialize)]
struct ModerationPayload<'a> {
    #[serde(rename = "ScenicSpotName")]
    scenic_spot_name: &'a str,
    #[serde(rename = "EvaluationScore")]
    evaluation_score: u8,
    content: &'a str,
}

/// How a workflow ended short of success.
#[derive(Debug)]
enum WorkflowFailure {
    /// Business failure, recorded as the event's terminal result.
    Failed(String),
    /// Ledger infrastructure failure; propagated, never recorded.
    Ledger(LedgerError),
}

impl WorkflowFailure {
    fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<LedgerError> for WorkflowFailure {
    fn from(err: LedgerError) -> Self {
        Self::Ledger(err)
    }
}

#[derive(Debug)]
pub struct WorkflowEngine<R, S> {
    reader: R,
    submitter: S,
    ai: AiClient,
    ledger: EventLedger,
    audit_model_id: String,
    summary_model_id: String,
}

impl<R: ContractReader, S: Submitter> WorkflowEngine<R, S> {
    pub fn new(
        reader: R,
        submitter: S,
        ai: AiClient,
        ledger: EventLedger,
        audit_model_id: String,
        summary_model_id: String,
    ) -> Self {
        Self {
            reader,
            submitter,
            ai,
            ledger,
            audit_model_id,
            summary_model_id,
        }
    }

    /// Process one event end to end: dedup check, claim, type-specific
    /// steps, terminal completion. Returns an error only when the ledger
    /// itself fails.
    pub async fn handle(&self, event: &ChainEvent) -> Result<(), LedgerError> {
        let event_id = event.event_id();
        if self.ledger.is_processed(&event_id)? {
            debug!(%event_id, "Event already processed, skipping");
            return Ok(());
        }
        if !self.ledger.claim(event)? {
            debug!(%event_id, "Event already claimed, skipping");
            return Ok(());
        }
        info!(%event_id, kind = %event.kind, block = event.block_number, "Processing event");

        let outcome = match event.payload {
            EventPayload::ReviewSubmitted {
                review_id,
                scenic_id,
                user,
            } => {
                self.review_submitted(&event_id, event.transaction_hash, review_id, scenic_id, user)
                    .await
            }
            EventPayload::ReviewApproved { review_id, .. } => {
                self.review_approved(&event_id, event.transaction_hash, review_id)
                    .await
            }
            EventPayload::SummaryUpdateRequired {
                scenic_id,
                from_review_index,
                to_review_index,
                ..
            } => {
                self.summary_update_required(
                    &event_id,
                    scenic_id,
                    from_review_index,
                    to_review_index,
                )
                .await
            }
            EventPayload::SummaryGenerated { scenic_id } => {
                self.summary_generated(&event_id, event.transaction_hash, scenic_id)
                    .await
            }
        };

        match outcome {
            Ok(result) => {
                info!(%event_id, result = %result, "Event processed");
                self.ledger.complete(event, ProcessingStatus::Success, &result)
            }
            Err(WorkflowFailure::Ledger(err)) => Err(err),
            Err(WorkflowFailure::Failed(message)) => {
                warn!(%event_id, %message, "Event processing failed");
                self.ledger.complete(event, ProcessingStatus::Failed, &message)
            }
        }
    }

    /// Backfill the submission hash, moderate the content, then publish the
    /// verdict. The status update is submitted for rejections too.
    async fn review_submitted(
        &self,
        event_id: &str,
        event_tx: B256,
        review_id: U256,
        scenic_id: U256,
        user: Address,
    ) -> Result<String, WorkflowFailure> {
        // Lookup failures degrade to empty inputs rather than failing the
        // workflow; moderation still runs.
        let (content, rating) = match self.reader.review(review_id).await {
            Ok(review) => (review.content, review.rating),
            Err(err) => {
                warn!(event_id, error = %err, "Review lookup failed, moderating empty content");
                (String::new(), 0)
            }
        };

        let update_tx = self
            .submit_or_fail(
                event_id,
                ContractCall::update_review_tx_hashes(review_id, event_tx, B256::ZERO),
                "Failed to update transaction hash",
            )
            .await?;

        let scenic_name = self.scenic_name(scenic_id).await;
        let payload = serde_json::to_string(&ModerationPayload {
            scenic_spot_name: &scenic_name,
            evaluation_score: rating,
            content: &content,
        })
        .map_err(|err| WorkflowFailure::failed(err.to_string()))?;

        let is_approved = self
            .ai
            .moderate(&payload, &self.audit_model_id)
            .await
            .map_err(|err| WorkflowFailure::failed(err.to_string()))?;
        let reason = if is_approved {
            "Content approved"
        } else {
            "Content contains inappropriate information"
        };
        info!(event_id, is_approved, "Moderation verdict");

        self.ledger.save_review_audit(&ReviewAuditRecord {
            review_id: review_id.to_string(),
            scenic_id: scenic_id.to_string(),
            user: user.to_string(),
            content,
            rating,
            is_approved,
            reason: reason.to_string(),
            audited_at: Utc::now(),
        })?;

        let status_tx = self
            .submit_or_fail(
                event_id,
                ContractCall::update_review_status(review_id, is_approved),
                "Failed to update review status",
            )
            .await?;

        Ok(format!(
            "tx_hash: {update_tx:#x}, approve_tx_hash: {status_tx:#x}"
        ))
    }

    /// Backfill the approval transaction hash.
    async fn review_approved(
        &self,
        event_id: &str,
        event_tx: B256,
        review_id: U256,
    ) -> Result<String, WorkflowFailure> {
        let tx_hash = self
            .submit_or_fail(
                event_id,
                ContractCall::update_review_tx_hashes(review_id, B256::ZERO, event_tx),
                "Failed to send transaction",
            )
            .await?;
        Ok(format!("{tx_hash:#x}"))
    }

    /// Summarize the requested review window and upload the result.
    async fn summary_update_required(
        &self,
        event_id: &str,
        scenic_id: U256,
        from_review_index: U256,
        to_review_index: U256,
    ) -> Result<String, WorkflowFailure> {
        let Some(count) = to_review_index
            .checked_sub(from_review_index)
            .map(|delta| delta + U256::ONE)
        else {
            warn!(event_id, "Malformed review index range");
            return Ok("Failed to get reviews for summary".to_string());
        };

        // A failed or empty batch is not an error: there is simply nothing
        // to summarize for this request.
        let (reviews, review_ids) = match self.reader.reviews_for_summary(scenic_id, count).await {
            Ok(batch) => batch,
            Err(err) => {
                warn!(event_id, error = %err, "Review batch lookup failed");
                return Ok("Failed to get reviews for summary".to_string());
            }
        };
        if reviews.is_empty() {
            return Ok("No reviews to summarize".to_string());
        }

        let scenic_name = self.scenic_name(scenic_id).await;
        let entries: Vec<String> = reviews
            .iter()
            .map(|review| {
                format!(
                    "content: {},EvaluationScore: {}",
                    extract_review_text(&review.content),
                    review.rating
                )
            })
            .collect();
        let summary_input = format!(
            "ScenicSpotName:{scenic_name},top20reviews: {}",
            entries.join(";")
        );

        let summary = self
            .ai
            .summarize(&summary_input, &self.summary_model_id)
            .await
            .map_err(|err| WorkflowFailure::failed(err.to_string()))?;
        if summary.is_empty() {
            return Err(WorkflowFailure::failed("Failed to generate summary"));
        }

        let tx_hash = self
            .submit_or_fail(
                event_id,
                ContractCall::upload_summary(scenic_id, summary.clone(), review_ids, to_review_index),
                "Failed to send transaction",
            )
            .await?;

        let key = scenic_id.to_string();
        let version = self.ledger.last_summary(&key)?.map_or(0, |record| record.version) + 1;
        self.ledger.save_summary(&SummaryRecord {
            scenic_id: key,
            version,
            content: summary,
            generated_at: Utc::now(),
        })?;

        Ok(format!("summary_id: {version}, tx_hash: {tx_hash:#x}"))
    }

    /// Backfill the generated summary's transaction hash.
    async fn summary_generated(
        &self,
        event_id: &str,
        event_tx: B256,
        scenic_id: U256,
    ) -> Result<String, WorkflowFailure> {
        let tx_hash = self
            .submit_or_fail(
                event_id,
                ContractCall::update_summary_tx_hash(scenic_id, event_tx),
                "Failed to send transaction",
            )
            .await?;
        Ok(format!("{tx_hash:#x}"))
    }

    async fn submit_or_fail(
        &self,
        event_id: &str,
        call: ContractCall,
        failure_message: &str,
    ) -> Result<B256, WorkflowFailure> {
        let function = call.function;
        match self.submitter.submit(event_id, call).await {
            Ok(tx_hash) => Ok(tx_hash),
            Err(err) => {
                warn!(event_id, function, error = %err, "Submission failed");
                Err(WorkflowFailure::failed(failure_message))
            }
        }
    }

    async fn scenic_name(&self, scenic_id: U256) -> String {
        match self.reader.scenic_spot(scenic_id).await {
            Ok((spot, _summary)) => spot.name,
            Err(err) => {
                warn!(scenic_id = %scenic_id, error = %err, "Scenic spot lookup failed, using fallback name");
                UNKNOWN_SCENIC_SPOT.to_string()
            }
        }
    }
}

/// On-chain review content is often a JSON envelope; the summary input wants
/// the inner text. Non-JSON content is used as is.
fn extract_review_text(content: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(content) {
        Ok(serde_json::Value::Object(fields)) => match fields.get("content") {
            Some(serde_json::Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        },
        _ => content.to_string(),
    }
}

#[async_trait]
impl<R: ContractReader, S: Submitter> EventSink for WorkflowEngine<R, S> {
    async fn deliver(&self, event: ChainEvent) -> Result<(), LedgerError> {
        self.handle(&event).await
    }
}
