//! Append-only outbound record stream
//!
//! Every record carries its asset id and timestamp so downstream stores can
//! index the stream as time series. A unit hands over the records of one
//! window as a single batch once the window is fully processed.

use crate::models::{
    AlertTransition, AssetId, FeatureVector, MaintenanceTask, Prediction, Timestamp, WindowMeta,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum PipelineRecord {
    Window(WindowMeta),
    Features(FeatureVector),
    Prediction(Prediction),
    AlertTransition(AlertTransition),
    MaintenanceTask(MaintenanceTask),
}

impl PipelineRecord {
    pub fn asset_id(&self) -> &AssetId {
        match self {
            PipelineRecord::Window(w) => &w.asset_id,
            PipelineRecord::Features(f) => &f.asset,
            PipelineRecord::Prediction(p) => &p.asset,
            PipelineRecord::AlertTransition(t) => &t.asset,
            PipelineRecord::MaintenanceTask(t) => &t.asset,
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        match self {
            PipelineRecord::Window(w) => w.end,
            PipelineRecord::Features(f) => f.window_end,
            PipelineRecord::Prediction(p) => p.timestamp,
            PipelineRecord::AlertTransition(t) => t.at,
            PipelineRecord::MaintenanceTask(t) => t.closed_at.unwrap_or(t.generated_at),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PipelineRecord::Window(_) => "window",
            PipelineRecord::Features(_) => "features",
            PipelineRecord::Prediction(_) => "prediction",
            PipelineRecord::AlertTransition(_) => "alert_transition",
            PipelineRecord::MaintenanceTask(_) => "maintenance_task",
        }
    }
}

/// Destination of the outbound record stream
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Append one batch; the batch is written in order or not at all
    async fn append(&self, batch: &[PipelineRecord]) -> Result<()>;
}

/// File the JSON-lines sink appends to, with rollback to a known length
#[async_trait]
trait AppendTarget: Send {
    async fn end_offset(&mut self) -> io::Result<u64>;

    async fn write_batch(&mut self, buf: &[u8]) -> io::Result<()>;

    async fn truncate(&mut self, len: u64) -> io::Result<()>;
}

#[async_trait]
impl AppendTarget for tokio::fs::File {
    async fn end_offset(&mut self) -> io::Result<u64> {
        Ok(self.metadata().await?.len())
    }

    async fn write_batch(&mut self, buf: &[u8]) -> io::Result<()> {
        self.write_all(buf).await?;
        self.flush().await
    }

    async fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len).await
    }
}

/// Append `buf` whole, or cut the target back to its previous end
async fn append_all_or_nothing<T: AppendTarget + ?Sized>(
    target: &mut T,
    buf: &[u8],
    path: &Path,
) -> Result<()> {
    let end = target
        .end_offset()
        .await
        .with_context(|| format!("Failed to stat {}", path.display()))?;
    let Err(write_err) = target.write_batch(buf).await else {
        return Ok(());
    };
    if let Err(truncate_err) = target.truncate(end).await {
        error!(
            path = %path.display(),
            offset = end,
            error = %truncate_err,
            "Failed to roll back partial record batch"
        );
        return Err(anyhow::Error::new(write_err).context(format!(
            "Failed to append to {} and a partial batch may remain: {truncate_err}",
            path.display()
        )));
    }
    Err(anyhow::Error::new(write_err).context(format!(
        "Failed to append to {}; batch rolled back",
        path.display()
    )))
}

/// JSON-lines file, one record per line, opened in append mode
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl JsonLinesSink {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create sink directory {}", parent.display()))?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open record sink {}", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordSink for JsonLinesSink {
    async fn append(&self, batch: &[PipelineRecord]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        // serialize everything first so a bad record never leaves a partial batch
        let mut buf = Vec::new();
        for record in batch {
            serde_json::to_writer(&mut buf, record).context("Failed to serialize record")?;
            buf.push(b'\n');
        }

        let mut file = self.file.lock().await;
        append_all_or_nothing(&mut *file, &buf, &self.path).await?;
        debug!(records = batch.len(), bytes = buf.len(), "Record batch appended");
        Ok(())
    }
}

/// In-process sink, used by tests and when no sink path is configured
#[derive(Debug, Default)]
pub struct MemorySink {
    records: std::sync::Mutex<Vec<PipelineRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<PipelineRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn append(&self, batch: &[PipelineRecord]) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock poisoned: {}", e))?;
        records.extend_from_slice(batch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AlertLevel, ComponentId, PredictionKind};
    use std::collections::BTreeMap;

    fn batch() -> Vec<PipelineRecord> {
        vec![
            PipelineRecord::Window(WindowMeta {
                asset_id: AssetId::from("truck-1"),
                start: 0,
                end: 60_000,
                sample_counts: BTreeMap::new(),
                missing_counts: BTreeMap::new(),
            }),
            PipelineRecord::AlertTransition(AlertTransition {
                asset: AssetId::from("truck-1"),
                component: ComponentId::from("engine"),
                from: AlertLevel::Normal,
                to: AlertLevel::Warning,
                at: 60_000,
                trigger: PredictionKind::Rul,
                value: 480.0,
            }),
        ]
    }

    #[test]
    fn test_record_tagging() {
        let records = batch();
        let json = serde_json::to_value(&records[1]).unwrap();
        assert_eq!(json["record"], "alert_transition");
        assert_eq!(json["asset_id"], "truck-1");
        assert_eq!(records[1].kind(), "alert_transition");
        assert_eq!(records[0].timestamp(), 60_000);
        assert_eq!(records[0].asset_id().as_str(), "truck-1");
    }

    #[tokio::test]
    async fn test_json_lines_appends_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("records.jsonl");

        let sink = JsonLinesSink::open(&path).await.unwrap();
        sink.append(&batch()).await.unwrap();
        drop(sink);
        let sink = JsonLinesSink::open(&path).await.unwrap();
        sink.append(&batch()[..1]).await.unwrap();
        sink.append(&[]).await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<PipelineRecord> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], batch()[0]);
        assert_eq!(lines[1], batch()[1]);
    }

    /// In-memory file that accepts `budget` more bytes, then fails mid-write
    struct ShortFile {
        data: Vec<u8>,
        budget: usize,
        truncate_fails: bool,
    }

    #[async_trait]
    impl AppendTarget for ShortFile {
        async fn end_offset(&mut self) -> io::Result<u64> {
            Ok(self.data.len() as u64)
        }

        async fn write_batch(&mut self, buf: &[u8]) -> io::Result<()> {
            let n = buf.len().min(self.budget);
            self.data.extend_from_slice(&buf[..n]);
            self.budget -= n;
            if n < buf.len() {
                return Err(io::Error::new(io::ErrorKind::Other, "no space left on device"));
            }
            Ok(())
        }

        async fn truncate(&mut self, len: u64) -> io::Result<()> {
            if self.truncate_fails {
                return Err(io::Error::new(io::ErrorKind::Other, "read-only file system"));
            }
            self.data.truncate(len as usize);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_write_rolls_back_partial_batch() {
        let path = Path::new("records.jsonl");
        let mut file = ShortFile {
            data: b"{\"earlier\":1}\n".to_vec(),
            budget: 8,
            truncate_fails: false,
        };
        let before = file.data.clone();

        let err = append_all_or_nothing(&mut file, b"{\"record\":\"window\"}\n", path)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("rolled back"));
        assert!(format!("{err:#}").contains("no space left"));
        assert_eq!(file.data, before);

        file.budget = 1_024;
        append_all_or_nothing(&mut file, b"{\"record\":\"window\"}\n", path)
            .await
            .unwrap();
        assert_eq!(file.data.len(), before.len() + 20);
    }

    #[tokio::test]
    async fn test_failed_rollback_is_reported() {
        let mut file = ShortFile {
            data: Vec::new(),
            budget: 3,
            truncate_fails: true,
        };
        let err = append_all_or_nothing(&mut file, b"0123456789", Path::new("r.jsonl"))
            .await
            .unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("partial batch may remain"), "{message}");
        assert!(message.contains("read-only"), "{message}");
    }

    #[tokio::test]
    async fn test_memory_sink() {
        let sink = MemorySink::new();
        assert!(sink.is_empty());
        sink.append(&batch()).await.unwrap();
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.records()[1].kind(), "alert_transition");
    }
}
