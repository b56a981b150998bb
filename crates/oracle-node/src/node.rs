//! Node lifecycle: startup checks, poller supervision, shutdown.
//!
//! [`OracleNode`] owns the wired production components and runs one
//! [`EventPoller`] per watched event kind. The node stays up for as long as
//! every poller does; a poller that fails fatally cancels the rest and the
//! node exits with its error. On the way out the ledger is flushed so a
//! restart sees every completed event.

use crate::{
    contract::{
        ContractReader,
        ScenicContract,
    },
    events::EventKind,
    ledger::{
        EventLedger,
        LedgerError,
    },
    poller::{
        EventPoller,
        PollerConfig,
        PollerError,
        RpcLogSource,
    },
    submitter::{
        RpcChainClient,
        TxSubmitter,
    },
    workflows::WorkflowEngine,
};
use alloy::primitives::Address;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{
    error,
    info,
    warn,
};

type Engine = WorkflowEngine<ScenicContract, TxSubmitter<RpcChainClient>>;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("event poller terminated")]
    Poller(#[source] PollerError),
    #[error("event poller task panicked")]
    Join(#[source] tokio::task::JoinError),
    #[error("ledger shutdown flush failed")]
    Ledger(#[source] LedgerError),
}

#[derive(Debug)]
pub struct OracleNode {
    source: RpcLogSource,
    contract: ScenicContract,
    engine: Arc<Engine>,
    ledger: EventLedger,
    oracle: Address,
    poller_config: PollerConfig,
}

impl OracleNode {
    pub fn new(
        source: RpcLogSource,
        contract: ScenicContract,
        engine: Engine,
        ledger: EventLedger,
        oracle: Address,
        poller_config: PollerConfig,
    ) -> Self {
        Self {
            source,
            contract,
            engine: Arc::new(engine),
            ledger,
            oracle,
            poller_config,
        }
    }

    /// Run until the token is cancelled or a poller dies.
    pub async fn run(self, token: CancellationToken) -> Result<(), NodeError> {
        info!(
            oracle = %self.oracle,
            contract = %self.contract.address(),
            "Starting oracle node"
        );
        self.verify_oracle_account().await;

        let mut handles = Vec::with_capacity(EventKind::ALL.len());
        for kind in EventKind::ALL {
            let poller = EventPoller::new(
                kind,
                self.source.clone(),
                Arc::clone(&self.engine),
                self.poller_config,
            );
            let token = token.clone();
            // A healthy poller never exits on its own, so any exit tears the
            // other pollers down through the guard. That keeps the sequential
            // join below from waiting on a task that will never finish.
            handles.push((
                kind,
                tokio::spawn(async move {
                    let _cancel_on_exit = token.clone().drop_guard();
                    poller.run(token).await
                }),
            ));
        }

        let mut outcome = Ok(());
        for (kind, handle) in handles {
            let failure = match handle.await {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => {
                    error!(kind = %kind, error = %err, "Event poller failed");
                    NodeError::Poller(err)
                }
                Err(err) => {
                    error!(kind = %kind, error = %err, "Event poller task panicked");
                    NodeError::Join(err)
                }
            };
            if outcome.is_ok() {
                outcome = Err(failure);
            }
        }

        if let Err(err) = self.ledger.flush() {
            error!(error = %err, "Ledger shutdown flush failed");
            if outcome.is_ok() {
                outcome = Err(NodeError::Ledger(err));
            }
        }
        info!("Oracle node stopped");
        outcome
    }

    /// The contract rejects writes from any account but its configured
    /// oracle, so a mismatch means every workflow transaction would revert.
    async fn verify_oracle_account(&self) {
        match self.contract.oracle_address().await {
            Ok(expected) if expected == self.oracle => {
                info!(oracle = %self.oracle, "Oracle account matches the contract");
            }
            Ok(expected) => {
                warn!(
                    configured = %self.oracle,
                    expected = %expected,
                    "Configured oracle account does not match the contract"
                );
            }
            Err(err) => {
                warn!(error = %err, "Could not verify the oracle account against the contract");
            }
        }
    }
}
