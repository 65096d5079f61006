//! On-disk spool files.
//!
//! Each spill writes one chunk of queued records to a fresh file, one JSON
//! payload per line, and syncs it before the chunk's memory is released.
//! A [`SpoolFile`] deletes its file when dropped, so spool files never
//! outlive the batch that references them within a run. After a crash they
//! are orphaned, which is fine: the sync restarts from the last acknowledged
//! checkpoint.

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use tempfile::TempPath;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::batch::IndexRange;
use crate::error::DestError;
use crate::stream::{StreamKey, WrappedRecord};

/// A durably written spool file covering a contiguous index range.
#[derive(Debug)]
pub struct SpoolFile {
    path: TempPath,
    byte_size: u64,
    range: IndexRange,
}

impl SpoolFile {
    /// Location on disk.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File size in bytes.
    #[must_use]
    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    /// Records in the file.
    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.range.len()
    }

    /// Index range of the records in the file.
    #[must_use]
    pub fn range(&self) -> IndexRange {
        self.range
    }

    /// Opens a lazy reader over the file's records.
    ///
    /// # Errors
    ///
    /// Returns `DestError::Io` if the file cannot be opened.
    pub fn reader(&self) -> Result<SpoolReader, DestError> {
        let file = File::open(&self.path)?;
        Ok(SpoolReader {
            lines: BufReader::new(file).lines(),
            path: self.path.to_path_buf(),
            range: self.range,
        })
    }
}

/// Lazy iterator over the payloads of a spool file, in index order.
#[derive(Debug)]
pub struct SpoolReader {
    lines: Lines<BufReader<File>>,
    path: PathBuf,
    range: IndexRange,
}

impl SpoolReader {
    /// Index range of the records being read.
    #[must_use]
    pub fn range(&self) -> IndexRange {
        self.range
    }

    /// Spool file being read.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Iterator for SpoolReader {
    type Item = Result<serde_json::Value, DestError>;

    fn next(&mut self) -> Option<Self::Item> {
        let line = self.lines.next()?;
        Some(
            line.map_err(DestError::from)
                .and_then(|l| serde_json::from_str(&l).map_err(DestError::from)),
        )
    }
}

/// Writes `records` to a new spool file in `dir`.
///
/// Returns `None` when `records` is empty: an end-of-stream-only chunk never
/// produces a file.
///
/// # Errors
///
/// Returns `DestError::Invariant` if the record indices are not consecutive,
/// or an I/O / serialization error from writing.
pub async fn spill_records(
    dir: &Path,
    stream: &StreamKey,
    records: &[WrappedRecord],
) -> Result<Option<SpoolFile>, DestError> {
    let Some(head) = records.first() else {
        return Ok(None);
    };

    tokio::fs::create_dir_all(dir).await?;
    let prefix = format!("{}-{}-", file_safe(stream), head.index);
    let (file, path) = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".jsonl")
        .tempfile_in(dir)?
        .into_parts();

    let mut writer = BufWriter::new(tokio::fs::File::from_std(file));
    let mut range = IndexRange::single(head.index);
    let mut byte_size = 0u64;
    let mut line = Vec::with_capacity(256);

    for record in records {
        if record.index != range.last() + 1 && record.index != head.index {
            return Err(DestError::Invariant(format!(
                "spool chunk for stream {stream} skips from index {} to {}",
                range.last(),
                record.index
            )));
        }
        line.clear();
        serde_json::to_writer(&mut line, &record.payload)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        byte_size += line.len() as u64;
        range.extend_to(record.index);
    }

    writer.flush().await?;
    writer.into_inner().sync_all().await?;

    tracing::debug!(
        stream = %stream,
        path = %path.display(),
        range = %range,
        bytes = byte_size,
        "Spooled records"
    );

    Ok(Some(SpoolFile {
        path,
        byte_size,
        range,
    }))
}

fn file_safe(stream: &StreamKey) -> String {
    stream
        .to_string()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn records(stream: &StreamKey, indices: std::ops::Range<u64>) -> Vec<WrappedRecord> {
        indices
            .map(|i| WrappedRecord {
                stream: stream.clone(),
                index: i,
                size_bytes: 16,
                payload: json!({ "id": i, "note": "line\nbreak" }),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_spill_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let stream = StreamKey::with_namespace("public", "users");
        let spool = spill_records(dir.path(), &stream, &records(&stream, 5..8))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(spool.range(), IndexRange::new(5, 7));
        assert_eq!(spool.record_count(), 3);
        assert_eq!(
            spool.byte_size(),
            std::fs::metadata(spool.path()).unwrap().len()
        );

        let ids: Vec<u64> = spool
            .reader()
            .unwrap()
            .map(|v| v.unwrap()["id"].as_u64().unwrap())
            .collect();
        assert_eq!(ids, vec![5, 6, 7]);
    }

    #[tokio::test]
    async fn test_empty_chunk_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let stream = StreamKey::new("s");
        assert!(spill_records(dir.path(), &stream, &[]).await.unwrap().is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_drop_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let stream = StreamKey::new("s");
        let spool = spill_records(dir.path(), &stream, &records(&stream, 0..2))
            .await
            .unwrap()
            .unwrap();
        let path = spool.path().to_path_buf();
        assert!(path.exists());
        drop(spool);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_gap_in_chunk_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let stream = StreamKey::new("s");
        let mut recs = records(&stream, 0..2);
        recs[1].index = 5;
        let err = spill_records(dir.path(), &stream, &recs).await.unwrap_err();
        assert!(err.is_invariant_violation());
    }

    #[test]
    fn test_file_safe_name() {
        assert_eq!(
            file_safe(&StreamKey::with_namespace("my schema", "a/b")),
            "my_schema.a_b"
        );
    }
}
