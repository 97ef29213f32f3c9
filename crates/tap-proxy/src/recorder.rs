use std::collections::BTreeMap;
use std::path::PathBuf;

use tap_cache::BodyFile;
use tap_http::{ResponseDecoder, ResponseEvent};
use tap_observe::{header_map, ExchangeRecord, RequestRecord, ResponseRecord};
use tracing::warn;

/// Assembles the exchange record on the upstream-facing side of the splice.
/// Fed the raw response bytes in relay order; publishes exactly once, when
/// the response ends.
pub(crate) struct ExchangeRecorder {
    flow_id: u64,
    request: RequestRecord,
    request_body_path: PathBuf,
    response_body: BodyFile,
    decoder: Option<ResponseDecoder>,
    response_head: Option<(u16, BTreeMap<String, String>)>,
    published: bool,
    publish: Box<dyn Fn(ExchangeRecord) + Send>,
}

impl ExchangeRecorder {
    pub(crate) fn new(
        flow_id: u64,
        request: RequestRecord,
        request_body_path: PathBuf,
        response_body: BodyFile,
        max_head_bytes: usize,
        publish: Box<dyn Fn(ExchangeRecord) + Send>,
    ) -> Self {
        let decoder = ResponseDecoder::new(request.method.clone(), max_head_bytes);
        Self {
            flow_id,
            request,
            request_body_path,
            response_body,
            decoder: Some(decoder),
            response_head: None,
            published: false,
            publish,
        }
    }

    pub(crate) async fn observe(&mut self, bytes: &[u8]) {
        let Some(decoder) = self.decoder.as_mut() else {
            return;
        };
        match decoder.feed(bytes) {
            Ok(events) => self.apply(events).await,
            Err(error) => {
                warn!(flow_id = self.flow_id, %error, "response capture disabled");
                self.decoder = None;
            }
        }
    }

    /// Upstream EOF: closes out a close-delimited response.
    pub(crate) async fn finish(&mut self) {
        let events = match self.decoder.as_mut() {
            Some(decoder) => decoder.finish(),
            None => return,
        };
        self.apply(events).await;
    }

    async fn apply(&mut self, events: Vec<ResponseEvent>) {
        for event in events {
            match event {
                ResponseEvent::Head(head) => {
                    let headers = header_map(
                        head.headers
                            .iter()
                            .map(|header| (header.name.as_str(), header.value.as_str())),
                    );
                    self.response_head = Some((head.status_code, headers));
                }
                ResponseEvent::BodyChunk(bytes) => {
                    if let Err(error) = self.response_body.append(&bytes).await {
                        warn!(flow_id = self.flow_id, %error, "response body capture failed");
                        self.decoder = None;
                        return;
                    }
                }
                ResponseEvent::End => self.publish_record(),
            }
        }
    }

    fn publish_record(&mut self) {
        if self.published {
            return;
        }
        let Some((status_code, headers)) = self.response_head.take() else {
            return;
        };

        let mut request = self.request.clone();
        if self.request_body_path.exists() {
            request.body = Some(self.request_body_path.clone());
        }
        let response = ResponseRecord {
            status_code,
            headers,
            body: self
                .response_body
                .has_data()
                .then(|| self.response_body.path().to_path_buf()),
        };

        (self.publish)(ExchangeRecord::new(self.flow_id, request, response));
        self.published = true;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tap_cache::BodyCache;
    use tap_observe::header_map;

    use super::*;

    fn request_record() -> RequestRecord {
        RequestRecord {
            url: "http://example.test/x".to_string(),
            method: "GET".to_string(),
            headers: header_map([("host", "example.test")]),
            body: None,
        }
    }

    async fn recorder_with_sink(
        dir: &std::path::Path,
    ) -> (ExchangeRecorder, Arc<Mutex<Vec<ExchangeRecord>>>) {
        let cache = BodyCache::create(dir).await.expect("create cache");
        let (request_body, response_body) = cache.into_parts();
        let published = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&published);
        let recorder = ExchangeRecorder::new(
            9,
            request_record(),
            request_body.path().to_path_buf(),
            response_body,
            64 * 1024,
            Box::new(move |record| sink.lock().expect("lock").push(record)),
        );
        (recorder, published)
    }

    #[tokio::test]
    async fn publishes_once_with_status_and_body_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut recorder, published) = recorder_with_sink(dir.path()).await;

        recorder
            .observe(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
            .await;
        recorder.finish().await;

        let records = published.lock().expect("lock");
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.flow_id, 9);
        assert_eq!(record.response.status_code, 200);
        assert!(record.request.body.is_none());
        let body_path = record.response.body.as_ref().expect("body path");
        assert_eq!(std::fs::read(body_path).expect("read body"), b"hello");
    }

    #[tokio::test]
    async fn body_less_response_records_no_body_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut recorder, published) = recorder_with_sink(dir.path()).await;

        recorder
            .observe(b"HTTP/1.1 204 No Content\r\n\r\n")
            .await;

        let records = published.lock().expect("lock");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].response.status_code, 204);
        assert!(records[0].response.body.is_none());
    }

    #[tokio::test]
    async fn unparseable_response_publishes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut recorder, published) = recorder_with_sink(dir.path()).await;

        recorder.observe(b"ceci n'est pas du HTTP\r\n\r\n").await;
        recorder.finish().await;

        assert!(published.lock().expect("lock").is_empty());
    }
}
