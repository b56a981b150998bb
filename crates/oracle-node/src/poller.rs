//! Chain event ingestion.
//!
//! One [`EventPoller`] per event kind scans the contract's logs in block
//! ranges: a lookback window on startup, then the delta between the last
//! scanned block and the head on every poll. Events are delivered to the
//! sink in ascending (block, log index) order within the kind; ordering
//! across kinds is not guaranteed.
//!
//! Provider failures at the log-source boundary come back classified as
//! [`SourceError`] variants. A rejected range is logged and skipped so one
//! poisoned window cannot wedge ingestion, while transient errors leave the
//! cursor in place and the range is retried on the next tick. Losing the
//! provider entirely is fatal after a bounded number of reconnect attempts.

use crate::{
    events::{
        ChainEvent,
        EventKind,
    },
    ledger::LedgerError,
};
use alloy::{
    primitives::Address,
    providers::{
        DynProvider,
        Provider,
    },
    rpc::types::Filter,
    transports::TransportError,
};
use async_trait::async_trait;
use std::{
    sync::Arc,
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    error,
    info,
    warn,
};

/// Node messages meaning the queried block range cannot be served, matched
/// case-insensitively against the RPC error payload.
const RANGE_REJECTED_MARKERS: [&str; 2] = ["block not found", "invalid block range"];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure of one log-source call, tagged by how the poller should react.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The node refused to serve the queried block range.
    #[error("Log range rejected: {0}")]
    RangeRejected(String),
    #[error("RPC call failed")]
    Rpc(#[source] TransportError),
}

#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    #[error("Provider unreachable after {attempts} reconnect attempts")]
    ConnectionLost {
        attempts: u32,
        #[source]
        last: SourceError,
    },
    #[error("Ledger failure while handling an event")]
    Ledger(#[from] LedgerError),
}

// ---------------------------------------------------------------------------
// Boundary traits
// ---------------------------------------------------------------------------

/// Read access to the chain's log stream.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Current head block number. Doubles as the connection health check.
    async fn head(&self) -> Result<u64, SourceError>;

    /// Decoded events of the kind in the inclusive block range.
    async fn events(
        &self,
        kind: EventKind,
        from: u64,
        to: u64,
    ) -> Result<Vec<ChainEvent>, SourceError>;
}

/// Where decoded events go. An error from the sink is an infrastructure
/// failure (workflow failures are recorded by the engine, not returned) and
/// stops ingestion.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, event: ChainEvent) -> Result<(), LedgerError>;
}

#[async_trait]
impl<T: EventSink> EventSink for Arc<T> {
    async fn deliver(&self, event: ChainEvent) -> Result<(), LedgerError> {
        (**self).deliver(event).await
    }
}

/// Live [`LogSource`] filtering the contract's logs by event signature.
#[derive(Debug, Clone)]
pub struct RpcLogSource {
    provider: DynProvider,
    contract: Address,
}

impl RpcLogSource {
    pub fn new(provider: DynProvider, contract: Address) -> Self {
        Self { provider, contract }
    }
}

#[async_trait]
impl LogSource for RpcLogSource {
    async fn head(&self) -> Result<u64, SourceError> {
        self.provider.get_block_number().await.map_err(SourceError::Rpc)
    }

    async fn events(
        &self,
        kind: EventKind,
        from: u64,
        to: u64,
    ) -> Result<Vec<ChainEvent>, SourceError> {
        let filter = Filter::new()
            .address(self.contract)
            .event_signature(kind.signature_hash())
            .from_block(from)
            .to_block(to);
        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(classify_log_error)?;

        let mut events = Vec::with_capacity(logs.len());
        for log in &logs {
            match ChainEvent::from_log(kind, log) {
                Ok(event) => events.push(event),
                // A log that matched the signature but does not decode is
                // unusable; drop it rather than wedge the whole range.
                Err(err) => warn!(kind = %kind, error = %err, "Skipping undecodable log"),
            }
        }
        Ok(events)
    }
}

fn classify_log_error(err: TransportError) -> SourceError {
    if let Some(payload) = err.as_error_resp() {
        let message = payload.message.to_lowercase();
        if RANGE_REJECTED_MARKERS
            .iter()
            .any(|marker| message.contains(marker))
        {
            return SourceError::RangeRejected(payload.message.to_string());
        }
    }
    SourceError::Rpc(err)
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct PollerConfig {
    pub poll_interval: Duration,
    pub lookback_blocks: u64,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            lookback_blocks: 500,
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 10,
        }
    }
}

pub struct EventPoller<L, S> {
    kind: EventKind,
    source: L,
    sink: S,
    config: PollerConfig,
    /// Next block to scan from, `None` until the startup scan ran.
    cursor: Option<u64>,
    consecutive_failures: u32,
}

impl<L: LogSource, S: EventSink> EventPoller<L, S> {
    pub fn new(kind: EventKind, source: L, sink: S, config: PollerConfig) -> Self {
        Self {
            kind,
            source,
            sink,
            config,
            cursor: None,
            consecutive_failures: 0,
        }
    }

    /// Poll until cancelled. Returns an error only when ingestion cannot
    /// continue: the reconnect budget is exhausted or the ledger failed.
    pub async fn run(mut self, token: CancellationToken) -> Result<(), PollerError> {
        info!(kind = %self.kind, "Event poller started");
        loop {
            self.tick().await?;

            let delay = if self.consecutive_failures > 0 {
                self.config.reconnect_delay
            } else {
                self.config.poll_interval
            };
            tokio::select! {
                () = token.cancelled() => {
                    info!(kind = %self.kind, "Event poller stopped");
                    return Ok(());
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One poll iteration: health-check the provider via the head, scan the
    /// new range, deliver in order, advance the cursor.
    async fn tick(&mut self) -> Result<(), PollerError> {
        let head = match self.source.head().await {
            Ok(head) => {
                self.consecutive_failures = 0;
                head
            }
            Err(err) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.max_reconnect_attempts {
                    error!(
                        kind = %self.kind,
                        attempts = self.consecutive_failures,
                        error = %err,
                        "Provider unreachable, giving up"
                    );
                    return Err(PollerError::ConnectionLost {
                        attempts: self.consecutive_failures,
                        last: err,
                    });
                }
                warn!(
                    kind = %self.kind,
                    attempt = self.consecutive_failures,
                    error = %err,
                    "Provider unreachable, will retry"
                );
                return Ok(());
            }
        };

        let from = match self.cursor {
            None => head.saturating_sub(self.config.lookback_blocks),
            Some(cursor) if cursor <= head => cursor,
            // Nothing new.
            Some(_) => return Ok(()),
        };

        match self.source.events(self.kind, from, head).await {
            Ok(mut events) => {
                if !events.is_empty() {
                    debug!(kind = %self.kind, from, to = head, count = events.len(), "Scanned events");
                }
                events.sort_by_key(|event| (event.block_number, event.log_index));
                for event in events {
                    self.sink.deliver(event).await?;
                }
                self.cursor = Some(head + 1);
            }
            Err(SourceError::RangeRejected(message)) => {
                warn!(kind = %self.kind, from, to = head, %message, "Log range rejected, skipping it");
                self.cursor = Some(head + 1);
            }
            Err(err) => {
                warn!(kind = %self.kind, from, to = head, error = %err, "Log fetch failed, will retry the range");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPayload;
    use alloy::{
        primitives::{
            B256,
            U256,
        },
        transports::TransportErrorKind,
    };
    use std::{
        collections::VecDeque,
        sync::Mutex as StdMutex,
    };

    fn review_event(block_number: u64, log_index: u64) -> ChainEvent {
        ChainEvent {
            kind: EventKind::ReviewSubmitted,
            block_number,
            log_index,
            transaction_hash: B256::repeat_byte(0xab),
            payload: EventPayload::ReviewSubmitted {
                review_id: U256::from(1),
                scenic_id: U256::from(2),
                user: Address::ZERO,
            },
        }
    }

    #[derive(Default)]
    struct ScriptedSource {
        heads: StdMutex<VecDeque<Result<u64, SourceError>>>,
        batches: StdMutex<VecDeque<Result<Vec<ChainEvent>, SourceError>>>,
        requested: StdMutex<Vec<(u64, u64)>>,
        last_head: StdMutex<u64>,
    }

    impl ScriptedSource {
        fn push_head(&self, head: Result<u64, SourceError>) {
            self.heads.lock().unwrap().push_back(head);
        }

        fn push_batch(&self, batch: Result<Vec<ChainEvent>, SourceError>) {
            self.batches.lock().unwrap().push_back(batch);
        }

        fn requested_ranges(&self) -> Vec<(u64, u64)> {
            self.requested.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LogSource for ScriptedSource {
        async fn head(&self) -> Result<u64, SourceError> {
            match self.heads.lock().unwrap().pop_front() {
                Some(Ok(head)) => {
                    *self.last_head.lock().unwrap() = head;
                    Ok(head)
                }
                Some(Err(err)) => Err(err),
                None => Ok(*self.last_head.lock().unwrap()),
            }
        }

        async fn events(
            &self,
            _kind: EventKind,
            from: u64,
            to: u64,
        ) -> Result<Vec<ChainEvent>, SourceError> {
            self.requested.lock().unwrap().push((from, to));
            self.batches
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        delivered: StdMutex<Vec<(u64, u64)>>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn deliver(&self, event: ChainEvent) -> Result<(), LedgerError> {
            self.delivered
                .lock()
                .unwrap()
                .push((event.block_number, event.log_index));
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl EventSink for FailingSink {
        async fn deliver(&self, _event: ChainEvent) -> Result<(), LedgerError> {
            Err(LedgerError::Sled(std::io::Error::other("disk gone")))
        }
    }

    fn poller(source: ScriptedSource) -> EventPoller<ScriptedSource, RecordingSink> {
        EventPoller::new(
            EventKind::ReviewSubmitted,
            source,
            RecordingSink::default(),
            PollerConfig {
                poll_interval: Duration::from_millis(1),
                lookback_blocks: 500,
                reconnect_delay: Duration::ZERO,
                max_reconnect_attempts: 3,
            },
        )
    }

    #[tokio::test]
    async fn startup_scan_covers_the_lookback_window() {
        let source = ScriptedSource::default();
        source.push_head(Ok(1000));
        let mut poller = poller(source);

        poller.tick().await.unwrap();

        assert_eq!(poller.source.requested_ranges(), vec![(500, 1000)]);
        assert_eq!(poller.cursor, Some(1001));
    }

    #[tokio::test]
    async fn lookback_saturates_at_genesis() {
        let source = ScriptedSource::default();
        source.push_head(Ok(3));
        let mut poller = poller(source);

        poller.tick().await.unwrap();

        assert_eq!(poller.source.requested_ranges(), vec![(0, 3)]);
    }

    #[tokio::test]
    async fn delivers_in_block_then_log_order() {
        let source = ScriptedSource::default();
        source.push_head(Ok(10));
        source.push_batch(Ok(vec![
            review_event(7, 2),
            review_event(5, 1),
            review_event(7, 0),
            review_event(5, 0),
        ]));
        let mut poller = poller(source);

        poller.tick().await.unwrap();

        assert_eq!(
            *poller.sink.delivered.lock().unwrap(),
            vec![(5, 0), (5, 1), (7, 0), (7, 2)]
        );
    }

    #[tokio::test]
    async fn idle_head_is_not_rescanned() {
        let source = ScriptedSource::default();
        source.push_head(Ok(100));
        source.push_head(Ok(100));
        source.push_head(Ok(103));
        let mut poller = poller(source);

        poller.tick().await.unwrap();
        poller.tick().await.unwrap();
        poller.tick().await.unwrap();

        // The second tick saw no new blocks and issued no query.
        assert_eq!(
            poller.source.requested_ranges(),
            vec![(0, 100), (101, 103)]
        );
    }

    #[tokio::test]
    async fn rejected_range_is_skipped() {
        let source = ScriptedSource::default();
        source.push_head(Ok(100));
        source.push_batch(Err(SourceError::RangeRejected(
            "invalid block range".to_string(),
        )));
        source.push_head(Ok(103));
        let mut poller = poller(source);

        poller.tick().await.unwrap();
        poller.tick().await.unwrap();

        // The poisoned window was not retried; scanning resumed after it.
        assert_eq!(
            poller.source.requested_ranges(),
            vec![(0, 100), (101, 103)]
        );
        assert!(poller.sink.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn transient_fetch_errors_retry_the_same_range() {
        let source = ScriptedSource::default();
        source.push_head(Ok(100));
        source.push_batch(Err(SourceError::Rpc(TransportErrorKind::custom_str(
            "connection reset",
        ))));
        source.push_head(Ok(100));
        source.push_batch(Ok(vec![review_event(99, 0)]));
        let mut poller = poller(source);

        poller.tick().await.unwrap();
        poller.tick().await.unwrap();

        assert_eq!(poller.source.requested_ranges(), vec![(0, 100), (0, 100)]);
        assert_eq!(*poller.sink.delivered.lock().unwrap(), vec![(99, 0)]);
    }

    #[tokio::test]
    async fn reconnect_budget_is_bounded() {
        let source = ScriptedSource::default();
        for _ in 0..3 {
            source.push_head(Err(SourceError::Rpc(TransportErrorKind::custom_str(
                "connection refused",
            ))));
        }
        let mut poller = poller(source);

        poller.tick().await.unwrap();
        poller.tick().await.unwrap();
        let err = poller.tick().await.unwrap_err();

        let PollerError::ConnectionLost { attempts, .. } = err else {
            panic!("expected connection loss, got {err:?}");
        };
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn reachable_head_resets_the_reconnect_budget() {
        let source = ScriptedSource::default();
        source.push_head(Err(SourceError::Rpc(TransportErrorKind::custom_str(
            "connection refused",
        ))));
        source.push_head(Err(SourceError::Rpc(TransportErrorKind::custom_str(
            "connection refused",
        ))));
        source.push_head(Ok(10));
        let mut poller = poller(source);

        poller.tick().await.unwrap();
        poller.tick().await.unwrap();
        assert_eq!(poller.consecutive_failures, 2);

        poller.tick().await.unwrap();
        assert_eq!(poller.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn sink_failure_stops_the_poller() {
        let source = ScriptedSource::default();
        source.push_head(Ok(10));
        source.push_batch(Ok(vec![review_event(9, 0)]));
        let mut poller = EventPoller::new(
            EventKind::ReviewSubmitted,
            source,
            FailingSink,
            PollerConfig::default(),
        );

        let err = poller.tick().await.unwrap_err();
        assert!(matches!(err, PollerError::Ledger(_)));
    }

    #[tokio::test]
    async fn run_stops_on_cancellation() {
        let source = ScriptedSource::default();
        source.push_head(Ok(10));
        let poller = poller(source);
        let token = CancellationToken::new();

        let handle = tokio::spawn(poller.run(token.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        let result = handle.await.unwrap();
        assert!(result.is_ok());
    }
}
