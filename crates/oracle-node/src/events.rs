//! Observed contract events and their derived identities.
//!
//! Every log the pollers pick up is decoded into a [`ChainEvent`] carrying
//! the fields the workflows need. The event id ties the ledger record to the
//! on-chain occurrence and must be stable across restarts, so it is derived
//! purely from (event name, transaction hash, log index).

use alloy::{
    primitives::{
        Address,
        B256,
        U256,
    },
    rpc::types::Log,
    sol_types::SolEvent,
};
use serde::{
    Deserialize,
    Serialize,
};

use crate::contract::{
    ReviewApproved,
    ReviewSubmitted,
    SummaryGenerated,
    SummaryUpdateRequired,
};

/// The four contract notifications the node watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    ReviewSubmitted,
    ReviewApproved,
    SummaryUpdateRequired,
    SummaryGenerated,
}

impl EventKind {
    pub const ALL: [Self; 4] = [
        Self::ReviewSubmitted,
        Self::ReviewApproved,
        Self::SummaryUpdateRequired,
        Self::SummaryGenerated,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::ReviewSubmitted => "ReviewSubmitted",
            Self::ReviewApproved => "ReviewApproved",
            Self::SummaryUpdateRequired => "SummaryUpdateRequired",
            Self::SummaryGenerated => "SummaryGenerated",
        }
    }

    /// Topic0 used to filter logs for this kind.
    pub fn signature_hash(self) -> B256 {
        match self {
            Self::ReviewSubmitted => ReviewSubmitted::SIGNATURE_HASH,
            Self::ReviewApproved => ReviewApproved::SIGNATURE_HASH,
            Self::SummaryUpdateRequired => SummaryUpdateRequired::SIGNATURE_HASH,
            Self::SummaryGenerated => SummaryGenerated::SIGNATURE_HASH,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Decoded arguments of one observed log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventPayload {
    ReviewSubmitted {
        review_id: U256,
        scenic_id: U256,
        user: Address,
    },
    ReviewApproved {
        review_id: U256,
        approved: bool,
    },
    SummaryUpdateRequired {
        scenic_id: U256,
        from_review_index: U256,
        to_review_index: U256,
        current_last_review_index: U256,
    },
    SummaryGenerated {
        scenic_id: U256,
    },
}

/// One on-chain event as delivered to the workflow engine. Immutable once
/// observed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainEvent {
    pub kind: EventKind,
    pub block_number: u64,
    pub log_index: u64,
    pub transaction_hash: B256,
    pub payload: EventPayload,
}

#[derive(Debug, thiserror::Error)]
pub enum EventDecodeError {
    #[error("Log missing {0}")]
    MissingField(&'static str),
    #[error("ABI decode error")]
    Abi(#[source] alloy::sol_types::Error),
}

impl ChainEvent {
    /// Derived identity: `{EventName}_{txHashHex}_{logIndex}`. Deterministic
    /// and collision-free for a given chain history.
    pub fn event_id(&self) -> String {
        format!(
            "{}_{}_{}",
            self.kind,
            hex::encode(self.transaction_hash),
            self.log_index
        )
    }

    /// Decode an RPC log of the given kind.
    pub fn from_log(kind: EventKind, log: &Log) -> Result<Self, EventDecodeError> {
        let transaction_hash = log
            .transaction_hash
            .ok_or(EventDecodeError::MissingField("transaction hash"))?;
        let block_number = log
            .block_number
            .ok_or(EventDecodeError::MissingField("block number"))?;
        let log_index = log
            .log_index
            .ok_or(EventDecodeError::MissingField("log index"))?;

        let payload = match kind {
            EventKind::ReviewSubmitted => {
                let ev = ReviewSubmitted::decode_log(&log.inner).map_err(EventDecodeError::Abi)?;
                EventPayload::ReviewSubmitted {
                    review_id: ev.data.reviewId,
                    scenic_id: ev.data.scenicId,
                    user: ev.data.user,
                }
            }
            EventKind::ReviewApproved => {
                let ev = ReviewApproved::decode_log(&log.inner).map_err(EventDecodeError::Abi)?;
                EventPayload::ReviewApproved {
                    review_id: ev.data.reviewId,
                    approved: ev.data.approved,
                }
            }
            EventKind::SummaryUpdateRequired => {
                let ev =
                    SummaryUpdateRequired::decode_log(&log.inner).map_err(EventDecodeError::Abi)?;
                EventPayload::SummaryUpdateRequired {
                    scenic_id: ev.data.scenicId,
                    from_review_index: ev.data.fromReviewIndex,
                    to_review_index: ev.data.toReviewIndex,
                    current_last_review_index: ev.data.currentLastReviewIndex,
                }
            }
            EventKind::SummaryGenerated => {
                let ev = SummaryGenerated::decode_log(&log.inner).map_err(EventDecodeError::Abi)?;
                EventPayload::SummaryGenerated {
                    scenic_id: ev.data.scenicId,
                }
            }
        };

        Ok(Self {
            kind,
            block_number,
            log_index,
            transaction_hash,
            payload,
        })
    }
}
