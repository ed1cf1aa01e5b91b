use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fareflow_core::{metrics, BatchSink, Error, Result, TabularRow};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;

/// Encode rows as CSV, optionally preceded by the row type's header.
pub fn encode_csv<R: TabularRow>(rows: &[R], with_header: bool) -> Result<Vec<u8>> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    if with_header {
        wtr.write_record(R::HEADER)?;
    }
    for row in rows {
        wtr.write_record(row.to_record())?;
    }
    wtr.into_inner().map_err(|e| Error::Io(e.into_error()))
}

fn sink_error(path: &Path) -> impl FnOnce(std::io::Error) -> Error + '_ {
    move |source| Error::SinkWrite {
        path: path.to_path_buf(),
        source,
    }
}

/// Writes every batch to `<root>/batch_id=<id>/part-00000.csv`.
///
/// Each batch owns its directory, so a batch never updates another batch's output. Writing
/// to a path that already exists fails instead of overwriting it.
pub struct CsvBatchSink {
    root: PathBuf,
}

impl CsvBatchSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn batch_path(&self, batch_id: u64) -> PathBuf {
        self.root
            .join(format!("batch_id={batch_id}"))
            .join("part-00000.csv")
    }
}

#[async_trait]
impl<R: TabularRow> BatchSink<R> for CsvBatchSink {
    async fn write_batch(&mut self, batch_id: u64, rows: &[R]) -> Result<()> {
        let bytes = encode_csv(rows, true)?;
        let path = self.batch_path(batch_id);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await.map_err(sink_error(dir))?;
        }
        let mut f = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(sink_error(&path))?;
        f.write_all(&bytes).await.map_err(sink_error(&path))?;
        f.flush().await.map_err(sink_error(&path))?;
        metrics::ROWS_WRITTEN
            .with_label_values(&["CsvBatchSink"])
            .inc_by(rows.len() as u64);
        metrics::BYTES_WRITTEN
            .with_label_values(&["CsvBatchSink"])
            .inc_by(bytes.len() as u64);
        info!(batch_id, rows = rows.len(), path = %path.display(), "batch written");
        Ok(())
    }
}

/// Appends every batch to one CSV file; the header is written when the file is new or empty.
pub struct CsvAppendSink {
    path: PathBuf,
}

impl CsvAppendSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl<R: TabularRow> BatchSink<R> for CsvAppendSink {
    async fn write_batch(&mut self, batch_id: u64, rows: &[R]) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await.map_err(sink_error(dir))?;
        }
        let fresh = fs::metadata(&self.path)
            .await
            .map(|m| m.len() == 0)
            .unwrap_or(true);
        let bytes = encode_csv(rows, fresh)?;
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(sink_error(&self.path))?;
        f.write_all(&bytes).await.map_err(sink_error(&self.path))?;
        f.flush().await.map_err(sink_error(&self.path))?;
        metrics::ROWS_WRITTEN
            .with_label_values(&["CsvAppendSink"])
            .inc_by(rows.len() as u64);
        metrics::BYTES_WRITTEN
            .with_label_values(&["CsvAppendSink"])
            .inc_by(bytes.len() as u64);
        info!(batch_id, rows = rows.len(), path = %self.path.display(), "batch appended");
        Ok(())
    }
}

/// Prints each batch to stdout under a `Batch: <id>` banner.
#[derive(Debug, Default)]
pub struct ConsoleSink;

#[async_trait]
impl<R: TabularRow> BatchSink<R> for ConsoleSink {
    async fn write_batch(&mut self, batch_id: u64, rows: &[R]) -> Result<()> {
        let bytes = encode_csv(rows, true)?;
        println!("-------------------------------------------");
        println!("Batch: {batch_id}");
        println!("-------------------------------------------");
        print!("{}", String::from_utf8_lossy(&bytes));
        Ok(())
    }
}
