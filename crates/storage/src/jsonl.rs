use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::StorageError;
use crate::record::AuditEntry;
use crate::traits::AuditLedger;

/// Audit ledger stored as a JSON-lines file: one serialized entry per line,
/// appended and fsynced per write. A missing file is an empty ledger.
///
/// A write interrupted by a crash can leave the file ending in a partial
/// line. Reads skip such a tail, and the next append repairs it before
/// writing: a tail that still parses gets its newline, anything else is cut.
#[derive(Debug)]
pub struct JsonLinesLedger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonLinesLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Caller holds `write_lock`.
    async fn repair_tail(&self) -> Result<(), StorageError> {
        let mut file = match tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .await
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if file.metadata().await?.len() == 0 {
            return Ok(());
        }
        file.seek(SeekFrom::End(-1)).await?;
        let mut last = [0u8; 1];
        file.read_exact(&mut last).await?;
        if last[0] == b'\n' {
            return Ok(());
        }

        let mut content = Vec::new();
        file.seek(SeekFrom::Start(0)).await?;
        file.read_to_end(&mut content).await?;
        let start = content
            .iter()
            .rposition(|b| *b == b'\n')
            .map_or(0, |i| i + 1);
        let tail = &content[start..];

        if serde_json::from_slice::<AuditEntry>(tail).is_ok() {
            warn!(path = %self.path.display(), "audit entry was missing its newline; terminating it");
            file.seek(SeekFrom::End(0)).await?;
            file.write_all(b"\n").await?;
        } else {
            warn!(
                path = %self.path.display(),
                bytes = tail.len(),
                "discarding torn audit entry at end of ledger"
            );
            file.set_len(start as u64).await?;
        }
        file.sync_data().await?;
        Ok(())
    }
}

#[async_trait]
impl AuditLedger for JsonLinesLedger {
    async fn append(&self, entry: &AuditEntry) -> Result<(), StorageError> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        self.repair_tail().await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn history(&self) -> Result<Vec<AuditEntry>, StorageError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let unterminated = !content.is_empty() && !content.ends_with('\n');
        let line_count = content.lines().count();

        let mut entries = Vec::with_capacity(line_count);
        for (i, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(e) if unterminated && i + 1 == line_count => {
                    warn!(
                        path = %self.path.display(),
                        line = i + 1,
                        error = %e,
                        "skipping torn audit entry at end of ledger"
                    );
                }
                Err(e) => {
                    return Err(StorageError::Serialization(format!(
                        "{} line {}: {}",
                        self.path.display(),
                        i + 1,
                        e
                    )))
                }
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance::{at_second, make_entry};
    use crate::record::AuditState;

    async fn write_raw(path: &Path, bytes: &[u8]) {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .unwrap();
        file.write_all(bytes).await.unwrap();
    }

    #[tokio::test]
    async fn torn_tail_is_skipped_and_cut_on_next_append() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = JsonLinesLedger::new(dir.path().join("audit.jsonl"));

        ledger
            .append(&make_entry("c1", AuditState::Applied, at_second(0)))
            .await
            .unwrap();
        write_raw(ledger.path(), br#"{"execution_id":"e2","sta"#).await;

        let read = ledger.history().await.unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].change_id, "c1");

        ledger
            .append(&make_entry("c2", AuditState::Applied, at_second(1)))
            .await
            .unwrap();
        let read = ledger.history().await.unwrap();
        let ids: Vec<&str> = read.iter().map(|e| e.change_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);

        let raw = tokio::fs::read_to_string(ledger.path()).await.unwrap();
        assert_eq!(raw.lines().count(), 2);
        assert!(raw.ends_with('\n'));
    }

    #[tokio::test]
    async fn complete_entry_missing_its_newline_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = JsonLinesLedger::new(dir.path().join("audit.jsonl"));
        let first = make_entry("c1", AuditState::Started, at_second(0));
        write_raw(ledger.path(), serde_json::to_string(&first).unwrap().as_bytes()).await;

        assert_eq!(ledger.history().await.unwrap(), vec![first.clone()]);

        let second = make_entry("c1", AuditState::Applied, at_second(1));
        ledger.append(&second).await.unwrap();
        assert_eq!(ledger.history().await.unwrap(), vec![first, second]);
    }

    #[tokio::test]
    async fn corrupt_line_before_the_tail_is_still_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = JsonLinesLedger::new(dir.path().join("audit.jsonl"));
        write_raw(ledger.path(), b"{not json}\n").await;
        ledger
            .append(&make_entry("c1", AuditState::Applied, at_second(0)))
            .await
            .unwrap();

        let err = ledger.history().await.unwrap_err();
        assert!(matches!(err, StorageError::Serialization(_)));
        assert!(err.to_string().contains("line 1"));
    }
}
