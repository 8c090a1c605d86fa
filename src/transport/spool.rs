//! CSV file-spool transport.
//!
//! Layout under the spool root:
//! - `outbound/` single-row CSV files we write, one per message
//! - `inbound/` files written by the far side, consumed oldest first
//! - `processed/` inbound files that were accepted
//!
//! Files are written to a `.tmp` name and renamed into place, so a reader
//! never sees a partial row. Inbound files failing checksum verification are
//! deleted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{MessageDeduplicator, Transport, TransportError, TransportHealth, TransportMessage, TransportStats};

const HEADER: &str = "msg_id,timestamp,msg_type,payload,checksum,priority,retry_count,max_retries";

pub struct SpoolTransport {
    name: String,
    root: Arc<PathBuf>,
    dedup: Arc<MessageDeduplicator>,
    stats: Arc<TransportStats>,
}

impl SpoolTransport {
    /// Open a spool rooted at `root`, creating its directories.
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Result<Self, TransportError> {
        let root = root.into();
        create_layout(&root)?;
        Ok(Self {
            name: name.into(),
            root: Arc::new(root),
            dedup: Arc::new(MessageDeduplicator::default()),
            stats: Arc::new(TransportStats::new(true)),
        })
    }

    #[must_use]
    pub fn with_deduplicator(mut self, dedup: Arc<MessageDeduplicator>) -> Self {
        self.dedup = dedup;
        self
    }

    pub fn outbound_dir(&self) -> PathBuf {
        self.root.join("outbound")
    }

    pub fn inbound_dir(&self) -> PathBuf {
        self.root.join("inbound")
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.root.join("processed")
    }

    /// Spool file name for `message` written at `at`.
    pub fn file_name(message: &TransportMessage, at: DateTime<Utc>) -> String {
        format!(
            "msg_{}_{}.csv",
            at.format("%Y%m%dT%H%M%S%6fZ"),
            message.short_id()
        )
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, TransportError>
    where
        F: FnOnce(&Path) -> Result<T, TransportError> + Send + 'static,
        T: Send + 'static,
    {
        let root = Arc::clone(&self.root);
        tokio::task::spawn_blocking(move || f(&root))
            .await
            .map_err(|e| TransportError::Io(std::io::Error::other(e)))?
    }
}

fn create_layout(root: &Path) -> Result<(), TransportError> {
    for dir in ["outbound", "inbound", "processed"] {
        fs::create_dir_all(root.join(dir))?;
    }
    Ok(())
}

fn write_atomic(dir: &Path, file_name: &str, contents: &str) -> Result<PathBuf, TransportError> {
    let final_path = dir.join(file_name);
    let temp_path = dir.join(format!(".{}.tmp", file_name));
    let mut file = fs::File::create(&temp_path)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    fs::rename(&temp_path, &final_path)?;
    Ok(final_path)
}

fn escape_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Split CSV text into records, honouring double-quoted fields. Quoted
/// fields may span lines; record separators outside quotes are `\n` or
/// `\r\n`.
fn split_records(text: &str) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, in_quotes) {
            ('"', true) if chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            ('"', true) => in_quotes = false,
            ('"', false) if current.is_empty() => in_quotes = true,
            (',', false) => fields.push(std::mem::take(&mut current)),
            ('\r', false) if chars.peek() == Some(&'\n') => {}
            ('\n', false) => {
                fields.push(std::mem::take(&mut current));
                records.push(std::mem::take(&mut fields));
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() || !fields.is_empty() {
        fields.push(current);
        records.push(fields);
    }
    records
}

/// Render a message as header plus one CSV row.
pub fn to_csv(message: &TransportMessage) -> Result<String, TransportError> {
    let payload = super::message::canonical_json(&message.payload);
    let row = [
        escape_field(&message.msg_id),
        escape_field(&message.timestamp.to_rfc3339()),
        escape_field(&message.msg_type),
        escape_field(&payload),
        escape_field(&message.checksum),
        message.priority.to_string(),
        message.retry_count.to_string(),
        message.max_retries.to_string(),
    ]
    .join(",");
    Ok(format!("{}\n{}\n", HEADER, row))
}

/// Parse a spool file. Checksums are not verified here.
pub fn from_csv(contents: &str) -> Result<TransportMessage, TransportError> {
    let malformed = |what: &str| {
        TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("malformed spool file: {}", what),
        ))
    };
    let fields = split_records(contents)
        .into_iter()
        .find(|record| {
            let blank = record.len() == 1 && record[0].trim().is_empty();
            !blank && record.join(",") != HEADER
        })
        .ok_or_else(|| malformed("no data row"))?;
    if fields.len() != 8 {
        return Err(malformed("expected 8 columns"));
    }
    Ok(TransportMessage {
        msg_id: fields[0].clone(),
        timestamp: DateTime::parse_from_rfc3339(&fields[1])
            .map_err(|_| malformed("timestamp"))?
            .with_timezone(&Utc),
        msg_type: fields[2].clone(),
        payload: serde_json::from_str(&fields[3])?,
        checksum: fields[4].clone(),
        priority: fields[5].parse().map_err(|_| malformed("priority"))?,
        retry_count: fields[6].parse().map_err(|_| malformed("retry_count"))?,
        max_retries: fields[7].parse().map_err(|_| malformed("max_retries"))?,
    })
}

#[async_trait]
impl Transport for SpoolTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: &TransportMessage) -> Result<(), TransportError> {
        let started = Instant::now();
        let contents = to_csv(message)?;
        let file_name = Self::file_name(message, Utc::now());

        let result = self
            .blocking(move |root| write_atomic(&root.join("outbound"), &file_name, &contents))
            .await;
        match result {
            Ok(path) => {
                self.stats.record_sent(started.elapsed());
                debug!(transport = %self.name, msg_id = %message.msg_id, path = %path.display(), "Message spooled");
                Ok(())
            }
            Err(e) => {
                let e = TransportError::Connectivity {
                    transport: self.name.clone(),
                    reason: e.to_string(),
                };
                self.stats.record_error(&e);
                Err(e)
            }
        }
    }

    async fn receive(&self) -> Result<Vec<TransportMessage>, TransportError> {
        let dedup = Arc::clone(&self.dedup);
        let name = self.name.clone();
        let accepted = self
            .blocking(move |root| {
                let inbound = root.join("inbound");
                let processed = root.join("processed");

                let mut files: Vec<PathBuf> = fs::read_dir(&inbound)?
                    .filter_map(|entry| entry.ok().map(|e| e.path()))
                    .filter(|p| p.extension().is_some_and(|ext| ext == "csv"))
                    .collect();
                // Names embed the UTC write time, so lexical order is age order
                files.sort();

                let mut accepted = Vec::new();
                for path in files {
                    let parsed = fs::read_to_string(&path)
                        .map_err(TransportError::from)
                        .and_then(|contents| from_csv(&contents));
                    let message = match parsed {
                        Ok(m) if m.validate_checksum() => m,
                        Ok(m) => {
                            warn!(transport = %name, msg_id = %m.msg_id, "Deleting spool file with bad checksum");
                            fs::remove_file(&path)?;
                            continue;
                        }
                        Err(e) => {
                            warn!(transport = %name, path = %path.display(), error = %e, "Deleting unreadable spool file");
                            fs::remove_file(&path)?;
                            continue;
                        }
                    };

                    if let Some(file_name) = path.file_name() {
                        fs::rename(&path, processed.join(file_name))?;
                    }
                    if dedup.check_and_insert(&message.msg_id) {
                        accepted.push(message);
                    } else {
                        debug!(transport = %name, msg_id = %message.msg_id, "Duplicate spool message ignored");
                    }
                }
                Ok(accepted)
            })
            .await?;

        self.stats.record_received(accepted.len() as u64);
        Ok(accepted)
    }

    fn health(&self) -> TransportHealth {
        self.stats.snapshot(&self.name)
    }

    async fn reset(&self) -> Result<(), TransportError> {
        self.blocking(|root| create_layout(root)).await?;
        self.stats.set_connected(true);
        info!(transport = %self.name, root = %self.root.display(), "Spool transport reset");
        Ok(())
    }

    async fn probe_latency(&self) -> Result<Duration, TransportError> {
        let started = Instant::now();
        let result = self
            .blocking(|root| {
                let path = write_atomic(root, "probe.csv", HEADER)?;
                fs::remove_file(path)?;
                Ok(())
            })
            .await;
        match result {
            Ok(()) => {
                let latency = started.elapsed();
                self.stats.set_connected(true);
                self.stats.record_latency(latency);
                Ok(latency)
            }
            Err(e) => {
                self.stats.record_error(&e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_csv_round_trip_with_embedded_quotes() {
        let msg = TransportMessage::new("order", json!({"note": "a, \"quoted\" value", "n": 1}))
            .with_priority(4);
        let csv = to_csv(&msg).unwrap();
        assert!(csv.starts_with(HEADER));
        let parsed = from_csv(&csv).unwrap();
        assert_eq!(parsed, msg);
        assert!(parsed.validate_checksum());
    }

    #[test]
    fn test_csv_fields_may_span_lines() {
        let msg = TransportMessage::new("order\nsplit", json!({"memo": "line one\r\nline two"}));
        let csv = to_csv(&msg).unwrap();
        let parsed = from_csv(&csv).unwrap();
        assert_eq!(parsed.msg_type, "order\nsplit");
        assert_eq!(parsed, msg);
        assert!(parsed.validate_checksum());

        // Written by a tool that uses CRLF record separators
        let crlf = csv.replacen('\n', "\r\n", 1);
        assert_eq!(from_csv(&crlf).unwrap(), msg);
    }

    #[test]
    fn test_csv_without_data_row_is_rejected() {
        assert!(from_csv(&format!("{}\n\n", HEADER)).is_err());
        assert!(from_csv("").is_err());
    }

    #[test]
    fn test_file_name_format() {
        let msg = TransportMessage::new("order", json!({}));
        let at = DateTime::parse_from_rfc3339("2024-03-01T12:00:00.123456Z")
            .unwrap()
            .with_timezone(&Utc);
        let name = SpoolTransport::file_name(&msg, at);
        assert_eq!(name, format!("msg_20240301T120000123456Z_{}.csv", msg.short_id()));
    }

    #[tokio::test]
    async fn test_send_writes_outbound_file() {
        let dir = tempfile::tempdir().unwrap();
        let spool = SpoolTransport::new("spool", dir.path()).unwrap();
        let msg = TransportMessage::new("order", json!({"ticket": 5}));
        spool.send(&msg).await.unwrap();

        let files: Vec<_> = fs::read_dir(spool.outbound_dir()).unwrap().collect();
        assert_eq!(files.len(), 1);
        let contents = fs::read_to_string(files[0].as_ref().unwrap().path()).unwrap();
        assert_eq!(from_csv(&contents).unwrap().msg_id, msg.msg_id);
        assert_eq!(spool.health().messages_sent, 1);
    }

    #[tokio::test]
    async fn test_receive_moves_good_deletes_bad_and_dedups() {
        let dir = tempfile::tempdir().unwrap();
        let spool = SpoolTransport::new("spool", dir.path()).unwrap();
        let inbound = spool.inbound_dir();

        let first = TransportMessage::new("tick", json!({"bid": 1.25}));
        let second = TransportMessage::new("tick", json!({"bid": 1.2}));
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::milliseconds(5);
        let t2 = t0 + chrono::Duration::milliseconds(10);
        let t3 = t0 + chrono::Duration::milliseconds(15);

        write_atomic(&inbound, &SpoolTransport::file_name(&second, t1), &to_csv(&second).unwrap()).unwrap();
        write_atomic(&inbound, &SpoolTransport::file_name(&first, t0), &to_csv(&first).unwrap()).unwrap();
        let bad = to_csv(&first).unwrap().replace("\"bid\":1.25", "\"bid\":9.75");
        let bad_name = SpoolTransport::file_name(&first, t2);
        write_atomic(&inbound, &bad_name, &bad).unwrap();
        // Same message delivered twice
        let dup_name = SpoolTransport::file_name(&second, t3);
        write_atomic(&inbound, &dup_name, &to_csv(&second).unwrap()).unwrap();

        let received = spool.receive().await.unwrap();
        let ids: Vec<_> = received.iter().map(|m| m.msg_id.clone()).collect();
        assert_eq!(ids, vec![first.msg_id.clone(), second.msg_id.clone()]);

        assert_eq!(fs::read_dir(&inbound).unwrap().count(), 0);
        assert_eq!(fs::read_dir(spool.processed_dir()).unwrap().count(), 3);
        assert!(!spool.processed_dir().join(bad_name).exists());
        assert_eq!(spool.health().messages_received, 2);
    }
}
