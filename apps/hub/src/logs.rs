//! Log hub (§4.2.3): an in-memory ring buffer, day-rotating NDJSON persistence, and a live
//! broadcast stream for `/logs/stream` subscribers.

use anyhow::{Context, Result};
use chain::{LogEvent, Severity};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc};

const TAIL_BYTES_PER_FILE: u64 = 512 * 1024;
const BROADCAST_CAPACITY: usize = 1024;

#[derive(Debug, Default, Clone)]
pub struct LogQuery {
    pub service: Option<String>,
    pub level: Option<Severity>,
    pub q: Option<String>,
    pub request_id: Option<String>,
    pub quote_id: Option<String>,
    pub intent_hash: Option<String>,
    pub sender: Option<String>,
    pub tx_hash: Option<String>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<usize>,
}

impl LogQuery {
    fn matches(&self, event: &LogEvent) -> bool {
        if let Some(service) = &self.service {
            if &event.service != service {
                return false;
            }
        }
        if let Some(level) = self.level {
            if event.level != level {
                return false;
            }
        }
        if let Some(q) = &self.q {
            let haystack = event.message.to_lowercase();
            let meta_hit = event
                .metadata
                .as_ref()
                .map(|m| serde_json::to_string(m).unwrap_or_default().to_lowercase())
                .unwrap_or_default();
            if !haystack.contains(&q.to_lowercase()) && !meta_hit.contains(&q.to_lowercase()) {
                return false;
            }
        }
        if let Some(v) = &self.request_id {
            if event.request_id.as_deref() != Some(v.as_str()) {
                return false;
            }
        }
        if let Some(v) = &self.quote_id {
            if event.quote_id.as_deref() != Some(v.as_str()) {
                return false;
            }
        }
        if let Some(v) = &self.intent_hash {
            if event.intent_hash.as_deref() != Some(v.as_str()) {
                return false;
            }
        }
        if let Some(v) = &self.sender {
            if event.sender.as_deref() != Some(v.as_str()) {
                return false;
            }
        }
        if let Some(v) = &self.tx_hash {
            if event.tx_hash.as_deref() != Some(v.as_str()) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.timestamp > until {
                return false;
            }
        }
        true
    }
}

pub struct LogStore {
    ring: Mutex<VecDeque<LogEvent>>,
    capacity: usize,
    broadcast_tx: broadcast::Sender<LogEvent>,
    append_tx: mpsc::UnboundedSender<LogEvent>,
}

impl LogStore {
    /// Rehydrates the ring buffer by tailing the most recent day files (§4.2.3), then returns
    /// the store plus the writer task future to spawn onto the caller's `JoinSet`.
    pub async fn new(
        data_dir: &Path,
        capacity: usize,
    ) -> Result<(Self, impl std::future::Future<Output = Result<()>> + Send + 'static)> {
        let logs_dir = data_dir.join("logs");
        fs::create_dir_all(&logs_dir)
            .await
            .context("create logs directory")?;

        let ring = rehydrate(&logs_dir, capacity).await?;
        let (broadcast_tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        let (append_tx, append_rx) = mpsc::unbounded_channel();

        let store = Self {
            ring: Mutex::new(ring),
            capacity,
            broadcast_tx,
            append_tx,
        };
        let writer = run_writer(logs_dir, append_rx);
        Ok((store, writer))
    }

    /// Ring-buffers and queues `event` for persistence, then fans it out to live subscribers, in
    /// that order (§4.2.3: persistence is best-effort and never blocks subscriber delivery).
    pub fn ingest(&self, event: LogEvent) {
        {
            let mut ring = self.ring.lock().expect("log ring mutex poisoned");
            push_capped(&mut ring, event.clone(), self.capacity);
        }
        let _ = self.broadcast_tx.send(event.clone());
        // An unbounded channel never blocks; a full disk or IO failure is logged by the writer
        // task and does not affect ring/broadcast delivery.
        let _ = self.append_tx.send(event);
    }

    pub fn query(&self, query: &LogQuery) -> Vec<LogEvent> {
        let ring = self.ring.lock().expect("log ring mutex poisoned");
        let limit = query.limit.unwrap_or(500).min(2000);
        ring.iter()
            .rev()
            .filter(|e| query.matches(e))
            .take(limit)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().expect("log ring mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.broadcast_tx.subscribe()
    }
}

fn push_capped(ring: &mut VecDeque<LogEvent>, event: LogEvent, capacity: usize) {
    if ring.len() >= capacity {
        ring.pop_front();
    }
    ring.push_back(event);
}

async fn run_writer(logs_dir: PathBuf, mut rx: mpsc::UnboundedReceiver<LogEvent>) -> Result<()> {
    let mut current_day: Option<String> = None;
    let mut file: Option<fs::File> = None;

    while let Some(event) = rx.recv().await {
        let day = day_string(event.timestamp);
        if current_day.as_deref() != Some(day.as_str()) {
            let path = logs_dir.join(format!("{day}.ndjson"));
            match fs::OpenOptions::new().create(true).append(true).open(&path).await {
                Ok(f) => {
                    file = Some(f);
                    current_day = Some(day);
                }
                Err(err) => {
                    tracing::warn!(err = %err, path = %path.display(), "failed to open log file for writing");
                    continue;
                }
            }
        }
        let Some(f) = file.as_mut() else { continue };
        let mut line = match serde_json::to_string(&event) {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(err = %err, "failed to serialize log event for persistence");
                continue;
            }
        };
        line.push('\n');
        if let Err(err) = f.write_all(line.as_bytes()).await {
            tracing::warn!(err = %err, "failed to append log event");
        }
    }
    Ok(())
}

async fn rehydrate(logs_dir: &Path, capacity: usize) -> Result<VecDeque<LogEvent>> {
    let mut file_names = Vec::new();
    let mut read_dir = match fs::read_dir(logs_dir).await {
        Ok(rd) => rd,
        Err(_) => return Ok(VecDeque::new()),
    };
    while let Some(entry) = read_dir.next_entry().await.context("read logs directory")? {
        if let Some(name) = entry.file_name().to_str() {
            if name.ends_with(".ndjson") {
                file_names.push(name.to_string());
            }
        }
    }
    file_names.sort();

    let mut per_file = Vec::new();
    let mut total = 0usize;
    for name in file_names.iter().rev() {
        if total >= capacity {
            break;
        }
        let events = tail_file(&logs_dir.join(name), TAIL_BYTES_PER_FILE).await?;
        total += events.len();
        per_file.push(events);
    }
    per_file.reverse();

    let mut ring = VecDeque::new();
    for events in per_file {
        for event in events {
            push_capped(&mut ring, event, capacity);
        }
    }
    Ok(ring)
}

async fn tail_file(path: &Path, max_bytes: u64) -> Result<Vec<LogEvent>> {
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    let mut f = match fs::File::open(path).await {
        Ok(f) => f,
        Err(_) => return Ok(Vec::new()),
    };
    let len = f.metadata().await.context("stat log file")?.len();
    let start = len.saturating_sub(max_bytes);
    f.seek(std::io::SeekFrom::Start(start)).await.context("seek log file")?;

    let mut buf = Vec::new();
    f.read_to_end(&mut buf).await.context("read log file")?;
    let text = String::from_utf8_lossy(&buf);

    let mut lines = text.split('\n');
    // If we started mid-file, the first line is almost certainly a truncated partial record.
    if start > 0 {
        lines.next();
    }

    Ok(lines
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str::<LogEvent>(l).ok())
        .collect())
}

/// Unix-seconds to a UTC `YYYY-MM-DD` string, no `chrono` dependency needed for a single
/// calendar conversion (Howard Hinnant's days-from-civil algorithm, run in reverse).
fn day_string(unix_secs: u64) -> String {
    let days = (unix_secs / 86_400) as i64;
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    format!("{y:04}-{m:02}-{d:02}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(service: &str, level: Severity, message: &str, timestamp: u64) -> LogEvent {
        let mut e = LogEvent::new(service, level, message);
        e.timestamp = timestamp;
        e
    }

    #[test]
    fn day_string_matches_known_dates() {
        assert_eq!(day_string(0), "1970-01-01");
        assert_eq!(day_string(1_700_000_000), "2023-11-14");
    }

    #[test]
    fn query_filters_by_level_and_substring() {
        let mut ring = VecDeque::new();
        push_capped(&mut ring, event("a", Severity::Info, "intent accepted", 1), 10);
        push_capped(&mut ring, event("a", Severity::Warn, "intent rejected", 2), 10);
        let query = LogQuery {
            level: Some(Severity::Warn),
            q: Some("reject".to_string()),
            ..Default::default()
        };
        let matched: Vec<_> = ring.iter().filter(|e| query.matches(e)).collect();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].message, "intent rejected");
    }

    #[test]
    fn push_capped_evicts_oldest_when_full() {
        let mut ring = VecDeque::new();
        for i in 0..5 {
            push_capped(&mut ring, event("a", Severity::Info, "m", i), 3);
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.front().unwrap().timestamp, 2);
        assert_eq!(ring.back().unwrap().timestamp, 4);
    }
}
