//! Command-line configuration and node wiring.
//!
//! Every option is a long flag with an environment fallback, so the node can
//! be driven from a `.env`-style deployment or a shell. [`Config::build`]
//! validates the raw strings, constructs the chain and AI clients, and
//! returns the fully wired [`OracleNode`].

use crate::{
    contract::ScenicContract,
    ledger::EventLedger,
    node::OracleNode,
    poller::{
        PollerConfig,
        RpcLogSource,
    },
    submitter::TxSubmitter,
    workflows::WorkflowEngine,
};
use ai_client::AiClient;
use alloy::{
    network::EthereumWallet,
    primitives::Address,
    providers::{
        Provider,
        ProviderBuilder,
    },
    signers::local::PrivateKeySigner,
};
use anyhow::Context;
use clap::Parser;
use std::{
    path::PathBuf,
    time::Duration,
};
use tracing::info;
use url::Url;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// HTTP JSON-RPC endpoint of the target chain
    #[arg(long, env = "RPC_URL", default_value = "https://rpc.sepolia.mantle.xyz")]
    pub rpc_url: String,

    /// Chain id used for transaction signing
    #[arg(long, env = "CHAIN_ID", default_value = "5003")]
    pub chain_id: u64,

    /// Hex-encoded private key of the oracle account
    #[arg(long, env = "ORACLE_PRIVATE_KEY")]
    pub oracle_private_key: String,

    /// Address of the deployed scenic review contract
    #[arg(long, env = "SCENIC_REVIEW_SYSTEM_ADDRESS")]
    pub contract_address: String,

    /// API key for the chat-completions endpoint
    #[arg(long, env = "VOLC_AI_API_KEY")]
    pub ai_api_key: String,

    /// Chat-completions endpoint URL
    #[arg(
        long,
        env = "VOLC_AI_API_URL",
        default_value = "https://ark.cn-beijing.volces.com/api/v3/bots/chat/completions"
    )]
    pub ai_api_url: String,

    /// Model used for moderation verdicts
    #[arg(long, env = "AUDIT_MODEL_ID")]
    pub audit_model_id: String,

    /// Model used for summary generation
    #[arg(long, env = "SUMMARY_MODEL_ID")]
    pub summary_model_id: String,

    /// Path of the ledger database
    #[arg(long, env = "ORACLE_DB_PATH", default_value = "oracle_data")]
    pub db_path: PathBuf,

    /// Ledger cache size in bytes
    #[arg(long, env = "ORACLE_DB_CACHE_BYTES", default_value = "1000000")]
    pub db_cache_bytes: usize,

    /// Submission attempts per transaction
    #[arg(long, env = "MAX_RETRIES", default_value = "3")]
    pub max_retries: u32,

    /// Delay between submission attempts, in seconds
    #[arg(long, env = "RETRY_DELAY", default_value = "5")]
    pub retry_delay_secs: u64,

    /// Delay between log polls, in seconds
    #[arg(long, env = "POLL_INTERVAL", default_value = "5")]
    pub poll_interval_secs: u64,

    /// Blocks scanned behind the head on startup
    #[arg(long, env = "LOOKBACK_BLOCKS", default_value = "500")]
    pub lookback_blocks: u64,

    /// Consecutive unreachable-head polls tolerated before giving up
    #[arg(long, env = "MAX_RECONNECT_ATTEMPTS", default_value = "10")]
    pub max_reconnect_attempts: u32,
}

impl Config {
    /// Validate the configuration and wire up the oracle node.
    pub async fn build(self) -> anyhow::Result<OracleNode> {
        let signer: PrivateKeySigner = self
            .oracle_private_key
            .parse()
            .context("invalid oracle private key")?;
        let oracle = signer.address();

        let contract_address: Address = self
            .contract_address
            .parse()
            .context("invalid contract address")?;
        let rpc_url: Url = self.rpc_url.parse().context("invalid RPC URL")?;

        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect_http(rpc_url.clone())
            .erased();
        info!(rpc_url = %rpc_url, chain_id = self.chain_id, oracle = %oracle, "Configured chain access");

        let ledger = EventLedger::open(&self.db_path, self.db_cache_bytes)
            .context("failed to open event ledger")?;
        info!(path = %self.db_path.display(), "Opened event ledger");

        let ai = AiClient::new(&self.ai_api_url, &self.ai_api_key)
            .context("failed to build AI client")?;

        let contract = ScenicContract::new(provider.clone(), contract_address, oracle);
        let submitter = TxSubmitter::new(
            provider.clone(),
            oracle,
            contract_address,
            self.chain_id,
            self.max_retries,
            Duration::from_secs(self.retry_delay_secs),
            ledger.clone(),
        );
        let engine = WorkflowEngine::new(
            contract.clone(),
            submitter,
            ai,
            ledger.clone(),
            self.audit_model_id,
            self.summary_model_id,
        );

        let poller_config = PollerConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            lookback_blocks: self.lookback_blocks,
            reconnect_delay: Duration::from_secs(self.retry_delay_secs),
            max_reconnect_attempts: self.max_reconnect_attempts,
        };

        Ok(OracleNode::new(
            RpcLogSource::new(provider, contract_address),
            contract,
            engine,
            ledger,
            oracle,
            poller_config,
        ))
    }
}
