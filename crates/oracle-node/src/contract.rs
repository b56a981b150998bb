//! Typed bindings and read access for the scenic review contract.
//!
//! Reads go through [`ContractReader`] so the workflow engine can be driven
//! by a scripted implementation in tests. Writes are expressed as
//! [`ContractCall`] values (function name plus encoded calldata) and handed
//! to the transaction submitter.

use alloy::{
    network::TransactionBuilder,
    primitives::{
        Address,
        B256,
        Bytes,
        U256,
    },
    providers::{
        DynProvider,
        Provider,
    },
    rpc::types::TransactionRequest,
    sol,
    sol_types::SolCall,
};
use async_trait::async_trait;
use serde_json::json;

sol! {
    #[derive(Debug, PartialEq, Eq)]
    struct Review {
        address user;
        uint256 scenicId;
        string content;
        uint8 rating;
        uint8 status;
        bool rewarded;
        uint256 timestamp;
        bytes32 submitTxHash;
        bytes32 approveTxHash;
    }

    #[derive(Debug, PartialEq, Eq)]
    struct ScenicSpot {
        uint256 id;
        string name;
        string location;
        uint256 createdAt;
    }

    #[derive(Debug, PartialEq, Eq)]
    struct Summary {
        string content;
        uint256[] reviewIds;
        uint256 lastReviewIndex;
        bytes32 txHash;
    }

    #[derive(Debug, PartialEq, Eq)]
    event ReviewSubmitted(uint256 reviewId, uint256 scenicId, address user);

    #[derive(Debug, PartialEq, Eq)]
    event ReviewApproved(uint256 reviewId, bool approved);

    #[derive(Debug, PartialEq, Eq)]
    event SummaryUpdateRequired(
        uint256 scenicId,
        uint256 fromReviewIndex,
        uint256 toReviewIndex,
        uint256 currentLastReviewIndex
    );

    #[derive(Debug, PartialEq, Eq)]
    event SummaryGenerated(uint256 scenicId);

    function reviews(uint256 reviewId) external view returns (Review memory);
    function getScenicSpot(uint256 scenicId)
        external
        view
        returns (ScenicSpot memory spot, Summary memory summary);
    function getReviewsForSummary(uint256 scenicId, uint256 count)
        external
        view
        returns (Review[] memory reviewList, uint256[] memory reviewIds);
    function oracleAddress() external view returns (address);

    function updateReviewTxHashes(uint256 reviewId, bytes32 submitHash, bytes32 approveHash) external;
    function updateReviewStatus(uint256 reviewId, bool approved) external;
    function uploadSummary(
        uint256 scenicId,
        string content,
        uint256[] reviewIds,
        uint256 lastReviewIndex
    ) external;
    function updateSummaryTxHash(uint256 scenicId, bytes32 txHash) external;
}

#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    #[error("RPC transport error")]
    Rpc(#[source] alloy::transports::TransportError),
    #[error("ABI decode error")]
    Abi(#[source] alloy::sol_types::Error),
}

/// Read access to contract state needed by the workflows.
#[async_trait]
pub trait ContractReader: Send + Sync {
    /// Full review lookup by id.
    async fn review(&self, review_id: U256) -> Result<Review, ContractError>;

    /// Scenic spot plus its current summary.
    async fn scenic_spot(&self, scenic_id: U256) -> Result<(ScenicSpot, Summary), ContractError>;

    /// Approved reviews for summarization together with their ids. The call
    /// is issued with the oracle account as caller since the contract gates
    /// it on the oracle address.
    async fn reviews_for_summary(
        &self,
        scenic_id: U256,
        count: U256,
    ) -> Result<(Vec<Review>, Vec<U256>), ContractError>;

    /// The oracle address the contract expects writes from.
    async fn oracle_address(&self) -> Result<Address, ContractError>;
}

/// A contract write intent: target function plus encoded calldata, with the
/// arguments rendered for the transaction audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractCall {
    pub function: &'static str,
    pub args: String,
    pub calldata: Bytes,
}

impl ContractCall {
    pub fn update_review_tx_hashes(review_id: U256, submit_hash: B256, approve_hash: B256) -> Self {
        Self {
            function: "updateReviewTxHashes",
            args: json!([
                review_id.to_string(),
                format!("{submit_hash:#x}"),
                format!("{approve_hash:#x}"),
            ])
            .to_string(),
            calldata: updateReviewTxHashesCall {
                reviewId: review_id,
                submitHash: submit_hash,
                approveHash: approve_hash,
            }
            .abi_encode()
            .into(),
        }
    }

    pub fn update_review_status(review_id: U256, approved: bool) -> Self {
        Self {
            function: "updateReviewStatus",
            args: json!([review_id.to_string(), approved]).to_string(),
            calldata: updateReviewStatusCall {
                reviewId: review_id,
                approved,
            }
            .abi_encode()
            .into(),
        }
    }

    pub fn upload_summary(
        scenic_id: U256,
        content: String,
        review_ids: Vec<U256>,
        last_review_index: U256,
    ) -> Self {
        Self {
            function: "uploadSummary",
            args: json!([
                scenic_id.to_string(),
                content,
                review_ids.iter().map(ToString::to_string).collect::<Vec<_>>(),
                last_review_index.to_string(),
            ])
            .to_string(),
            calldata: uploadSummaryCall {
                scenicId: scenic_id,
                content,
                reviewIds: review_ids,
                lastReviewIndex: last_review_index,
            }
            .abi_encode()
            .into(),
        }
    }

    pub fn update_summary_tx_hash(scenic_id: U256, tx_hash: B256) -> Self {
        Self {
            function: "updateSummaryTxHash",
            args: json!([scenic_id.to_string(), format!("{tx_hash:#x}")]).to_string(),
            calldata: updateSummaryTxHashCall {
                scenicId: scenic_id,
                txHash: tx_hash,
            }
            .abi_encode()
            .into(),
        }
    }
}

/// Provider-backed implementation of [`ContractReader`].
#[derive(Debug, Clone)]
pub struct ScenicContract {
    provider: DynProvider,
    address: Address,
    oracle: Address,
}

impl ScenicContract {
    pub fn new(provider: DynProvider, address: Address, oracle: Address) -> Self {
        Self {
            provider,
            address,
            oracle,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    async fn call<C: SolCall>(
        &self,
        call: C,
        from: Option<Address>,
    ) -> Result<C::Return, ContractError> {
        let mut tx = TransactionRequest::default()
            .with_to(self.address)
            .with_input(call.abi_encode());
        if let Some(from) = from {
            tx = tx.with_from(from);
        }

        let data = self.provider.call(tx).await.map_err(ContractError::Rpc)?;
        C::abi_decode_returns(&data).map_err(ContractError::Abi)
    }
}

#[async_trait]
impl ContractReader for ScenicContract {
    async fn review(&self, review_id: U256) -> Result<Review, ContractError> {
        self.call(reviewsCall { reviewId: review_id }, None).await
    }

    async fn scenic_spot(&self, scenic_id: U256) -> Result<(ScenicSpot, Summary), ContractError> {
        let ret = self
            .call(getScenicSpotCall { scenicId: scenic_id }, None)
            .await?;
        Ok((ret.spot, ret.summary))
    }

    async fn reviews_for_summary(
        &self,
        scenic_id: U256,
        count: U256,
    ) -> Result<(Vec<Review>, Vec<U256>), ContractError> {
        let ret = self
            .call(
                getReviewsForSummaryCall {
                    scenicId: scenic_id,
                    count,
                },
                Some(self.oracle),
            )
            .await?;
        Ok((ret.reviewList, ret.reviewIds))
    }

    async fn oracle_address(&self) -> Result<Address, ContractError> {
        self.call(oracleAddressCall {}, None).await
    }
}
