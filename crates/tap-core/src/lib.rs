//! Proxy configuration, target validation, and the engine that assigns flow
//! ids and publishes completed-exchange records.

mod config;
mod target;

pub use config::{ProxyConfig, ProxyConfigError};
pub use target::{
    parse_connect_target, parse_forward_target, ConnectTarget, ConnectTargetError, ForwardTarget,
    ForwardTargetError, DEFAULT_PORT,
};

use std::sync::atomic::{AtomicU64, Ordering};

use tap_observe::{ExchangeRecord, RecordSink};
use tokio::sync::broadcast;

const RECORD_CHANNEL_CAPACITY: usize = 256;

/// Shared per-process engine: allocates flow ids and fans completed-exchange
/// records out to the configured sink plus any live subscribers.
pub struct ProxyEngine<S>
where
    S: RecordSink,
{
    pub config: ProxyConfig,
    sink: S,
    records_tx: broadcast::Sender<ExchangeRecord>,
    next_flow_id: AtomicU64,
}

impl<S> ProxyEngine<S>
where
    S: RecordSink,
{
    pub fn new(config: ProxyConfig, sink: S) -> Self {
        let (records_tx, _) = broadcast::channel(RECORD_CHANNEL_CAPACITY);
        Self {
            config,
            sink,
            records_tx,
            next_flow_id: AtomicU64::new(1),
        }
    }

    pub fn allocate_flow_id(&self) -> u64 {
        self.next_flow_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Publishes one completed exchange. Subscribers that have lagged past
    /// the channel capacity miss records; the sink always receives them.
    pub fn publish_record(&self, record: ExchangeRecord) {
        self.sink.publish(record.clone());
        let _ = self.records_tx.send(record);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExchangeRecord> {
        self.records_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tap_observe::{RequestRecord, ResponseRecord, VecRecordSink};

    use super::*;

    fn sample_record(flow_id: u64) -> ExchangeRecord {
        ExchangeRecord::new(
            flow_id,
            RequestRecord {
                url: "http://example.test/".to_string(),
                method: "GET".to_string(),
                headers: BTreeMap::new(),
                body: None,
            },
            ResponseRecord {
                status_code: 200,
                headers: BTreeMap::new(),
                body: None,
            },
        )
    }

    #[test]
    fn flow_ids_are_unique_and_increasing() {
        let engine = ProxyEngine::new(ProxyConfig::default(), VecRecordSink::default());
        let first = engine.allocate_flow_id();
        let second = engine.allocate_flow_id();
        assert!(second > first);
    }

    #[tokio::test]
    async fn publish_reaches_sink_and_subscribers() {
        let sink = VecRecordSink::default();
        let engine = ProxyEngine::new(ProxyConfig::default(), sink.clone());
        let mut subscriber = engine.subscribe();

        let record = sample_record(engine.allocate_flow_id());
        engine.publish_record(record.clone());

        assert_eq!(sink.snapshot(), vec![record.clone()]);
        assert_eq!(subscriber.recv().await.expect("record"), record);
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let sink = VecRecordSink::default();
        let engine = ProxyEngine::new(ProxyConfig::default(), sink.clone());
        engine.publish_record(sample_record(1));
        assert_eq!(sink.snapshot().len(), 1);
    }
}
