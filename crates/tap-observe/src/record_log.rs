use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::{ExchangeRecord, RecordSink};

/// Appends each published record as one JSON line. Write failures are
/// counted rather than propagated so a full disk never takes the proxy down.
#[derive(Debug)]
pub struct RecordLogSink {
    writer: Mutex<BufWriter<File>>,
    write_error_count: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl RecordLogSink {
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if path.as_os_str().is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "record log path must not be empty",
            ));
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            write_error_count: AtomicU64::new(0),
            last_error: Mutex::new(None),
        })
    }

    pub fn flush(&self) -> io::Result<()> {
        self.writer.lock().expect("record log writer lock").flush()
    }

    pub fn write_error_count(&self) -> u64 {
        self.write_error_count.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().expect("record log error slot lock").clone()
    }

    fn try_write(&self, record: &ExchangeRecord) -> io::Result<()> {
        let mut line = serde_json::to_vec(record)
            .map_err(|error| io::Error::other(format!("serialize exchange record: {error}")))?;
        line.push(b'\n');

        let mut writer = self.writer.lock().expect("record log writer lock");
        writer.write_all(&line)?;
        writer.flush()
    }
}

impl RecordSink for RecordLogSink {
    fn publish(&self, record: ExchangeRecord) {
        if let Err(error) = self.try_write(&record) {
            self.write_error_count.fetch_add(1, Ordering::Relaxed);
            *self.last_error.lock().expect("record log error slot lock") = Some(error.to_string());
        }
    }
}
