//! Structured records for completed proxy exchanges and the sinks that
//! receive them.

mod record_log;

pub use record_log::RecordLogSink;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Metadata captured from a proxied request: the absolute URL, the method,
/// the headers flattened last-wins, and the path of the captured body file
/// when any body bytes were observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestRecord {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseRecord {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Option<PathBuf>,
}

/// One completed request/response exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExchangeRecord {
    pub flow_id: u64,
    pub completed_at_unix_ms: u128,
    pub request: RequestRecord,
    pub response: ResponseRecord,
}

impl ExchangeRecord {
    pub fn new(flow_id: u64, request: RequestRecord, response: ResponseRecord) -> Self {
        Self {
            flow_id,
            completed_at_unix_ms: now_unix_ms(),
            request,
            response,
        }
    }
}

/// Flattens header pairs into a last-wins map.
pub fn header_map<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for (name, value) in pairs {
        map.insert(name.to_ascii_lowercase(), value.to_string());
    }
    map
}

pub trait RecordSink: Send + Sync {
    fn publish(&self, record: ExchangeRecord);
}

impl RecordSink for Box<dyn RecordSink> {
    fn publish(&self, record: ExchangeRecord) {
        (**self).publish(record);
    }
}

#[derive(Debug, Default)]
pub struct NoopRecordSink;

impl RecordSink for NoopRecordSink {
    fn publish(&self, _record: ExchangeRecord) {}
}

#[derive(Debug, Default, Clone)]
pub struct VecRecordSink {
    records: Arc<Mutex<Vec<ExchangeRecord>>>,
}

impl VecRecordSink {
    pub fn snapshot(&self) -> Vec<ExchangeRecord> {
        self.records.lock().expect("record store lock").clone()
    }
}

impl RecordSink for VecRecordSink {
    fn publish(&self, record: ExchangeRecord) {
        self.records.lock().expect("record store lock").push(record);
    }
}

fn now_unix_ms() -> u128 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis(),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_map_flattens_duplicates_last_wins() {
        let map = header_map([("Accept", "a"), ("X-Dup", "1"), ("x-dup", "2")]);
        assert_eq!(map.get("accept").map(String::as_str), Some("a"));
        assert_eq!(map.get("x-dup").map(String::as_str), Some("2"));
    }

    #[test]
    fn vec_sink_accumulates_published_records() {
        let sink = VecRecordSink::default();
        let record = ExchangeRecord::new(
            7,
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
        );
        sink.publish(record.clone());
        assert_eq!(sink.snapshot(), vec![record]);
    }
}
