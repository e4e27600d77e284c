//! Diagnostic taps that observe every kernel message the bridge routes.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use jupyter_protocol::{JupyterMessage, JupyterMessageContent};
use log::{debug, warn};
use serde::Serialize;

use crate::error::Result;

/// Observer for raw kernel messages. Must not block.
pub trait MessageTap: Send + Sync {
    /// `dir` is "in" (from kernel) or "out" (to kernel); `ch` is the channel.
    fn observe(&self, dir: &'static str, ch: &'static str, message: &JupyterMessage);
}

/// Logs message types at debug level.
pub struct LogTap;

impl MessageTap for LogTap {
    fn observe(&self, dir: &'static str, ch: &'static str, message: &JupyterMessage) {
        let comm_id = match &message.content {
            JupyterMessageContent::CommOpen(c) => Some(c.comm_id.0.as_str()),
            JupyterMessageContent::CommMsg(c) => Some(c.comm_id.0.as_str()),
            JupyterMessageContent::CommClose(c) => Some(c.comm_id.0.as_str()),
            _ => None,
        };
        debug!(
            "[{}:{}] type={} parent_msg_id={:?} comm_id={:?}",
            ch,
            dir,
            message.header.msg_type,
            message.parent_header.as_ref().map(|h| &h.msg_id),
            comm_id
        );
    }
}

/// Entry in the dump file: a message plus when and where it was seen.
#[derive(Serialize)]
struct DumpEntry<'a> {
    /// ISO 8601 timestamp when the message was logged
    ts: String,
    dir: &'static str,
    ch: &'static str,
    msg_type: &'a str,
    msg_id: &'a str,
    parent_msg_id: Option<&'a str>,
    content: &'a JupyterMessageContent,
    buffer_count: usize,
}

/// Appends one JSON line per observed message to a file.
pub struct DumpTap {
    file: Mutex<File>,
}

impl DumpTap {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl MessageTap for DumpTap {
    fn observe(&self, dir: &'static str, ch: &'static str, message: &JupyterMessage) {
        let entry = DumpEntry {
            ts: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            dir,
            ch,
            msg_type: &message.header.msg_type,
            msg_id: &message.header.msg_id,
            parent_msg_id: message.parent_header.as_ref().map(|h| h.msg_id.as_str()),
            content: &message.content,
            buffer_count: message.buffers.len(),
        };
        let json = match serde_json::to_string(&entry) {
            Ok(json) => json,
            Err(e) => {
                warn!("[dump] Failed to serialize {}: {}", message.header.msg_type, e);
                return;
            }
        };
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "{}", json);
            let _ = f.flush();
        }
    }
}

/// Fans a message out to several taps.
#[derive(Default, Clone)]
pub struct Taps(Vec<Arc<dyn MessageTap>>);

impl Taps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, tap: Arc<dyn MessageTap>) -> Self {
        self.0.push(tap);
        self
    }
}

impl MessageTap for Taps {
    fn observe(&self, dir: &'static str, ch: &'static str, message: &JupyterMessage) {
        for tap in &self.0 {
            tap.observe(dir, ch, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::build_message;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingTap(AtomicUsize);

    impl MessageTap for CountingTap {
        fn observe(&self, _dir: &'static str, _ch: &'static str, _message: &JupyterMessage) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_dump_tap_writes_one_line_per_message() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("dump.jsonl");
        let tap = DumpTap::create(&path).unwrap();

        let stream = build_message("stream", json!({"name": "stdout", "text": "hi"})).unwrap();
        let status = build_message("status", json!({"execution_state": "idle"})).unwrap();
        tap.observe("in", "iopub", &stream);
        tap.observe("in", "iopub", &status);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["msg_type"], "stream");
        assert_eq!(lines[0]["dir"], "in");
        assert_eq!(lines[0]["ch"], "iopub");
        assert_eq!(lines[1]["msg_type"], "status");
        assert!(lines[1]["ts"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn test_taps_fan_out() {
        let a = Arc::new(CountingTap(AtomicUsize::new(0)));
        let b = Arc::new(CountingTap(AtomicUsize::new(0)));
        let taps = Taps::new().with(a.clone()).with(b.clone()).with(Arc::new(LogTap));

        let message = build_message("status", json!({"execution_state": "busy"})).unwrap();
        taps.observe("in", "iopub", &message);

        assert_eq!(a.0.load(Ordering::SeqCst), 1);
        assert_eq!(b.0.load(Ordering::SeqCst), 1);
    }
}
