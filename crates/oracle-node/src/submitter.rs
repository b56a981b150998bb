//! Nonce-managed transaction submission.
//!
//! All contract writes funnel through one [`TxSubmitter`], which owns the
//! oracle account's nonce cursor. A submission holds the cursor lock from
//! nonce assignment through receipt confirmation, so concurrent workflows
//! serialize on the account and nonces are handed out consecutively with no
//! gaps. Failures are classified at the RPC boundary into
//! [`ChainClientError`] variants; the retry loop matches on those tags and
//! never inspects error strings itself.

use crate::{
    contract::ContractCall,
    ledger::{
        EventLedger,
        TxStatus,
    },
};
use alloy::{
    network::TransactionBuilder,
    primitives::{
        Address,
        B256,
    },
    providers::{
        DynProvider,
        PendingTransactionBuilder,
        PendingTransactionError,
        Provider,
        WatchTxError,
    },
    rpc::types::TransactionRequest,
    transports::TransportError,
};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{
    debug,
    info,
    warn,
};

/// How long to wait for a receipt before treating the attempt as lost.
const RECEIPT_TIMEOUT_SECS: u64 = 120;

/// Node messages that mean the nonce cursor no longer matches the account
/// state, matched case-insensitively against the RPC error payload.
const NONCE_CONFLICT_MARKERS: [&str; 2] = ["nonce too low", "replacement transaction underpriced"];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure of a single chain interaction, tagged by how the submitter should
/// react to it.
#[derive(Debug, thiserror::Error)]
pub enum ChainClientError {
    /// The node rejected the transaction's nonce. The cached cursor is stale
    /// and must be resynced from the chain before the next attempt.
    #[error("Nonce conflict: {0}")]
    NonceConflict(String),
    /// The transaction was accepted but no receipt arrived in time.
    #[error("Timed out waiting for the transaction receipt")]
    ReceiptTimeout,
    #[error("RPC call failed")]
    Rpc(#[source] TransportError),
    #[error("Receipt watch failed")]
    Receipt(#[source] PendingTransactionError),
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The transaction was mined with a failed status. Retrying would revert
    /// again, so the submission fails immediately.
    #[error("Transaction {tx_hash} reverted on chain")]
    Reverted { tx_hash: B256 },
    #[error("Gave up after {attempts} submission attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: ChainClientError,
    },
}

/// Per-attempt outcome, internal to the retry loop.
#[derive(Debug)]
enum TryError {
    Reverted { tx_hash: B256 },
    Chain(ChainClientError),
}

// ---------------------------------------------------------------------------
// Chain boundary
// ---------------------------------------------------------------------------

/// Outcome of a mined transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOutcome {
    pub tx_hash: B256,
    pub success: bool,
}

/// The chain operations a submission needs. Errors come back already
/// classified so callers react to variants rather than message strings.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Confirmed transaction count of the account, i.e. its next nonce.
    async fn transaction_count(&self, address: Address) -> Result<u64, ChainClientError>;

    async fn gas_price(&self) -> Result<u128, ChainClientError>;

    async fn estimate_gas(&self, tx: TransactionRequest) -> Result<u64, ChainClientError>;

    /// Broadcast the transaction, returning its hash once the node accepts
    /// it into the mempool.
    async fn send(&self, tx: TransactionRequest) -> Result<B256, ChainClientError>;

    /// Wait until the transaction is mined or the timeout elapses.
    async fn confirm(
        &self,
        tx_hash: B256,
        timeout: Duration,
    ) -> Result<TxOutcome, ChainClientError>;
}

/// Live [`ChainClient`] over a wallet-equipped provider.
pub struct RpcChainClient {
    provider: DynProvider,
}

impl RpcChainClient {
    pub fn new(provider: DynProvider) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn transaction_count(&self, address: Address) -> Result<u64, ChainClientError> {
        self.provider
            .get_transaction_count(address)
            .await
            .map_err(ChainClientError::Rpc)
    }

    async fn gas_price(&self) -> Result<u128, ChainClientError> {
        self.provider.get_gas_price().await.map_err(ChainClientError::Rpc)
    }

    async fn estimate_gas(&self, tx: TransactionRequest) -> Result<u64, ChainClientError> {
        self.provider.estimate_gas(tx).await.map_err(ChainClientError::Rpc)
    }

    async fn send(&self, tx: TransactionRequest) -> Result<B256, ChainClientError> {
        let pending = self
            .provider
            .send_transaction(tx)
            .await
            .map_err(classify_send_error)?;
        Ok(*pending.tx_hash())
    }

    async fn confirm(
        &self,
        tx_hash: B256,
        timeout: Duration,
    ) -> Result<TxOutcome, ChainClientError> {
        let receipt = PendingTransactionBuilder::new(self.provider.root().clone(), tx_hash)
            .with_required_confirmations(1)
            .with_timeout(Some(timeout))
            .get_receipt()
            .await
            .map_err(classify_receipt_error)?;

        Ok(TxOutcome {
            tx_hash: receipt.transaction_hash,
            success: receipt.status(),
        })
    }
}

fn classify_send_error(err: TransportError) -> ChainClientError {
    if let Some(payload) = err.as_error_resp() {
        let message = payload.message.to_lowercase();
        if NONCE_CONFLICT_MARKERS
            .iter()
            .any(|marker| message.contains(marker))
        {
            return ChainClientError::NonceConflict(payload.message.to_string());
        }
    }
    ChainClientError::Rpc(err)
}

fn classify_receipt_error(err: PendingTransactionError) -> ChainClientError {
    match err {
        PendingTransactionError::TxWatcher(WatchTxError::Timeout) => {
            ChainClientError::ReceiptTimeout
        }
        other => ChainClientError::Receipt(other),
    }
}

// ---------------------------------------------------------------------------
// Submitter
// ---------------------------------------------------------------------------

/// Write access to the contract. One confirmed transaction per call.
#[async_trait]
pub trait Submitter: Send + Sync {
    /// Submit the call and wait until it is mined, returning the hash of the
    /// confirmed transaction.
    async fn submit(&self, event_id: &str, call: ContractCall) -> Result<B256, SubmitError>;
}

pub struct TxSubmitter<C> {
    chain: C,
    oracle: Address,
    contract: Address,
    chain_id: u64,
    max_retries: u32,
    retry_delay: Duration,
    receipt_timeout: Duration,
    /// Next nonce to use, or `None` when it must be fetched from the chain.
    /// Held locked from nonce assignment through receipt confirmation.
    nonce: Mutex<Option<u64>>,
    ledger: EventLedger,
}

impl TxSubmitter<RpcChainClient> {
    pub fn new(
        provider: DynProvider,
        oracle: Address,
        contract: Address,
        chain_id: u64,
        max_retries: u32,
        retry_delay: Duration,
        ledger: EventLedger,
    ) -> Self {
        Self::with_chain(
            RpcChainClient::new(provider),
            oracle,
            contract,
            chain_id,
            max_retries,
            retry_delay,
            ledger,
        )
    }
}

impl<C: ChainClient> TxSubmitter<C> {
    pub fn with_chain(
        chain: C,
        oracle: Address,
        contract: Address,
        chain_id: u64,
        max_retries: u32,
        retry_delay: Duration,
        ledger: EventLedger,
    ) -> Self {
        Self {
            chain,
            oracle,
            contract,
            chain_id,
            max_retries,
            retry_delay,
            receipt_timeout: Duration::from_secs(RECEIPT_TIMEOUT_SECS),
            nonce: Mutex::new(None),
            ledger,
        }
    }

    /// One full attempt: lock the cursor, assign a nonce, send and wait for
    /// the receipt. The lock is held until the attempt resolves.
    async fn try_once(&self, event_id: &str, call: &ContractCall) -> Result<B256, TryError> {
        let mut cursor = self.nonce.lock().await;

        let nonce = match *cursor {
            Some(nonce) => nonce,
            None => {
                let fetched = self
                    .chain
                    .transaction_count(self.oracle)
                    .await
                    .map_err(TryError::Chain)?;
                debug!(nonce = fetched, "Synced nonce cursor from chain");
                *cursor = Some(fetched);
                fetched
            }
        };

        let gas_price = self.chain.gas_price().await.map_err(TryError::Chain)?;
        let tx = TransactionRequest::default()
            .with_from(self.oracle)
            .with_to(self.contract)
            .with_input(call.calldata.clone())
            .with_nonce(nonce)
            .with_gas_price(gas_price)
            .with_chain_id(self.chain_id);
        let gas_limit = self
            .chain
            .estimate_gas(tx.clone())
            .await
            .map_err(TryError::Chain)?;
        let tx = tx.with_gas_limit(gas_limit);

        let tx_hash = match self.chain.send(tx).await {
            Ok(tx_hash) => tx_hash,
            Err(err) => {
                if matches!(err, ChainClientError::NonceConflict(_)) {
                    *cursor = None;
                }
                return Err(TryError::Chain(err));
            }
        };

        // The audit trail is best effort: the transaction is already in
        // flight, so a failed ledger write must not trigger a re-send.
        if let Err(err) =
            self.ledger
                .record_submitted_tx(&format!("{tx_hash:#x}"), event_id, call.function, &call.args)
        {
            warn!(%tx_hash, error = %err, "Failed to record submitted transaction");
        }

        let outcome = self
            .chain
            .confirm(tx_hash, self.receipt_timeout)
            .await
            .map_err(TryError::Chain)?;

        if outcome.success {
            *cursor = Some(nonce + 1);
            if let Err(err) = self
                .ledger
                .record_tx_outcome(&format!("{tx_hash:#x}"), TxStatus::Confirmed)
            {
                warn!(%tx_hash, error = %err, "Failed to record transaction confirmation");
            }
            info!(
                event_id,
                function = call.function,
                %tx_hash,
                nonce,
                "Transaction confirmed"
            );
            Ok(outcome.tx_hash)
        } else {
            // The revert still consumed the nonce on chain, so the cursor is
            // resynced on the next submission.
            *cursor = None;
            if let Err(err) = self
                .ledger
                .record_tx_outcome(&format!("{tx_hash:#x}"), TxStatus::Reverted)
            {
                warn!(%tx_hash, error = %err, "Failed to record transaction revert");
            }
            Err(TryError::Reverted {
                tx_hash: outcome.tx_hash,
            })
        }
    }
}

#[async_trait]
impl<C: ChainClient> Submitter for TxSubmitter<C> {
    async fn submit(&self, event_id: &str, call: ContractCall) -> Result<B256, SubmitError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_once(event_id, &call).await {
                Ok(tx_hash) => return Ok(tx_hash),
                Err(TryError::Reverted { tx_hash }) => {
                    return Err(SubmitError::Reverted { tx_hash });
                }
                Err(TryError::Chain(err)) => {
                    if attempt >= self.max_retries {
                        return Err(SubmitError::RetriesExhausted {
                            attempts: attempt,
                            last: err,
                        });
                    }
                    warn!(
                        event_id,
                        function = call.function,
                        attempt,
                        error = %err,
                        "Submission attempt failed, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::ContractCall;
    use alloy::{
        primitives::U256,
        rpc::json_rpc::ErrorPayload,
        transports::{
            RpcError,
            TransportErrorKind,
        },
    };
    use std::{
        collections::VecDeque,
        sync::Mutex as StdMutex,
    };

    #[derive(Debug, Clone, Copy)]
    enum FakeReceipt {
        Success,
        Reverted,
        Timeout,
    }

    /// In-memory chain that enforces real nonce rules: a send is accepted
    /// only when its nonce equals the account's current transaction count,
    /// and every accepted send consumes the nonce.
    struct FakeChain {
        chain_nonce: StdMutex<u64>,
        confirmations: StdMutex<VecDeque<FakeReceipt>>,
        send_failures: StdMutex<VecDeque<ChainClientError>>,
        accepted: StdMutex<Vec<u64>>,
        count_fetches: StdMutex<u32>,
    }

    impl FakeChain {
        fn new(chain_nonce: u64, confirmations: Vec<FakeReceipt>) -> Self {
            Self {
                chain_nonce: StdMutex::new(chain_nonce),
                confirmations: StdMutex::new(confirmations.into()),
                send_failures: StdMutex::new(VecDeque::new()),
                accepted: StdMutex::new(Vec::new()),
                count_fetches: StdMutex::new(0),
            }
        }

        fn push_send_failure(&self, err: ChainClientError) {
            self.send_failures.lock().unwrap().push_back(err);
        }

        fn accepted_nonces(&self) -> Vec<u64> {
            self.accepted.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChainClient for FakeChain {
        async fn transaction_count(&self, _address: Address) -> Result<u64, ChainClientError> {
            *self.count_fetches.lock().unwrap() += 1;
            Ok(*self.chain_nonce.lock().unwrap())
        }

        async fn gas_price(&self) -> Result<u128, ChainClientError> {
            Ok(1_000_000_000)
        }

        async fn estimate_gas(&self, _tx: TransactionRequest) -> Result<u64, ChainClientError> {
            Ok(100_000)
        }

        async fn send(&self, tx: TransactionRequest) -> Result<B256, ChainClientError> {
            if let Some(err) = self.send_failures.lock().unwrap().pop_front() {
                return Err(err);
            }

            let tx_nonce = tx.nonce.unwrap();
            let mut chain_nonce = self.chain_nonce.lock().unwrap();
            if tx_nonce != *chain_nonce {
                return Err(ChainClientError::NonceConflict(format!(
                    "nonce too low: next nonce {chain_nonce}, tx nonce {tx_nonce}"
                )));
            }

            *chain_nonce += 1;
            self.accepted.lock().unwrap().push(tx_nonce);
            Ok(B256::with_last_byte(tx_nonce as u8 + 1))
        }

        async fn confirm(
            &self,
            tx_hash: B256,
            _timeout: Duration,
        ) -> Result<TxOutcome, ChainClientError> {
            match self.confirmations.lock().unwrap().pop_front() {
                Some(FakeReceipt::Success) => Ok(TxOutcome {
                    tx_hash,
                    success: true,
                }),
                Some(FakeReceipt::Reverted) => Ok(TxOutcome {
                    tx_hash,
                    success: false,
                }),
                Some(FakeReceipt::Timeout) | None => Err(ChainClientError::ReceiptTimeout),
            }
        }
    }

    fn submitter(chain: FakeChain) -> TxSubmitter<FakeChain> {
        TxSubmitter::with_chain(
            chain,
            Address::repeat_byte(0x11),
            Address::repeat_byte(0x22),
            5003,
            3,
            Duration::ZERO,
            EventLedger::temporary().unwrap(),
        )
    }

    fn status_call() -> ContractCall {
        ContractCall::update_review_status(U256::from(7), true)
    }

    #[tokio::test]
    async fn sequential_submissions_use_consecutive_nonces() {
        let submitter = submitter(FakeChain::new(
            5,
            vec![FakeReceipt::Success, FakeReceipt::Success, FakeReceipt::Success],
        ));

        for _ in 0..3 {
            submitter.submit("ev", status_call()).await.unwrap();
        }

        assert_eq!(submitter.chain.accepted_nonces(), vec![5, 6, 7]);
        // The cursor was synced from the chain once and advanced locally
        // afterwards.
        assert_eq!(*submitter.chain.count_fetches.lock().unwrap(), 1);
        assert_eq!(*submitter.nonce.lock().await, Some(8));
    }

    #[tokio::test]
    async fn concurrent_submissions_serialize_on_the_cursor() {
        let submitter = submitter(FakeChain::new(0, vec![FakeReceipt::Success; 4]));

        let (a, b, c, d) = tokio::join!(
            submitter.submit("ev-a", status_call()),
            submitter.submit("ev-b", status_call()),
            submitter.submit("ev-c", status_call()),
            submitter.submit("ev-d", status_call()),
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();
        d.unwrap();

        // The fake rejects any nonce that does not match the account state,
        // so four successes prove the submissions were gap-free and in order.
        assert_eq!(submitter.chain.accepted_nonces(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn stale_cursor_resyncs_and_lands_on_the_next_nonce() {
        let submitter = submitter(FakeChain::new(5, vec![FakeReceipt::Success]));
        *submitter.nonce.lock().await = Some(3);

        let tx_hash = submitter.submit("ev", status_call()).await.unwrap();

        // First attempt was rejected as a conflict, second landed on the
        // chain's real next nonce.
        assert_eq!(submitter.chain.accepted_nonces(), vec![5]);
        assert_eq!(*submitter.nonce.lock().await, Some(6));

        let record = submitter
            .ledger
            .oracle_tx(&format!("{tx_hash:#x}"))
            .unwrap()
            .unwrap();
        assert_eq!(record.status, TxStatus::Confirmed);
        assert_eq!(record.function, "updateReviewStatus");
    }

    #[tokio::test]
    async fn reverted_transaction_fails_without_retry() {
        let submitter = submitter(FakeChain::new(
            0,
            vec![FakeReceipt::Reverted, FakeReceipt::Success],
        ));

        let err = submitter.submit("ev", status_call()).await.unwrap_err();
        let SubmitError::Reverted { tx_hash } = err else {
            panic!("expected revert, got {err:?}");
        };

        // One attempt only, and the audit trail shows the revert.
        assert_eq!(submitter.chain.accepted_nonces(), vec![0]);
        let record = submitter
            .ledger
            .oracle_tx(&format!("{tx_hash:#x}"))
            .unwrap()
            .unwrap();
        assert_eq!(record.status, TxStatus::Reverted);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let chain = FakeChain::new(0, vec![]);
        for _ in 0..4 {
            chain.push_send_failure(ChainClientError::Rpc(TransportErrorKind::custom_str(
                "connection refused",
            )));
        }
        let submitter = submitter(chain);

        let err = submitter.submit("ev", status_call()).await.unwrap_err();
        let SubmitError::RetriesExhausted { attempts, .. } = err else {
            panic!("expected exhaustion, got {err:?}");
        };
        assert_eq!(attempts, 3);
        assert!(submitter.chain.accepted_nonces().is_empty());
        // The fourth scripted failure was never reached.
        assert_eq!(submitter.chain.send_failures.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn receipt_timeout_self_heals_through_resync() {
        // The first send is accepted but its receipt never arrives. The
        // retry reuses the old nonce, gets rejected because the chain moved
        // on, resyncs, and lands with the fresh nonce.
        let submitter = submitter(FakeChain::new(
            0,
            vec![FakeReceipt::Timeout, FakeReceipt::Success],
        ));

        submitter.submit("ev", status_call()).await.unwrap();

        assert_eq!(submitter.chain.accepted_nonces(), vec![0, 1]);
        assert_eq!(*submitter.nonce.lock().await, Some(2));
    }

    #[test]
    fn nonce_conflict_messages_are_classified() {
        let resp = |message: &str| -> TransportError {
            RpcError::ErrorResp(ErrorPayload {
                code: -32000,
                message: message.to_string().into(),
                data: None,
            })
        };

        assert!(matches!(
            classify_send_error(resp("nonce too low: next nonce 5, tx nonce 3")),
            ChainClientError::NonceConflict(_)
        ));
        assert!(matches!(
            classify_send_error(resp("Replacement Transaction Underpriced")),
            ChainClientError::NonceConflict(_)
        ));
        assert!(matches!(
            classify_send_error(resp("insufficient funds for gas * price + value")),
            ChainClientError::Rpc(_)
        ));
        assert!(matches!(
            classify_send_error(TransportErrorKind::custom_str("connection reset")),
            ChainClientError::Rpc(_)
        ));
    }
}
