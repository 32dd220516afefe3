//! Output file and storage writer.
//!
//! [`create_output`] truncates the output file and writes its two header rows. The
//! [`StorageWriter`] task then drains rows from an unbounded channel, batches them and
//! appends each batch once it reaches `batch_size`, and on shutdown drains whatever is
//! still queued before a final flush.
//!
//! The file is reopened in append mode for every flush. A flush that fails is logged and
//! its batch is dropped; the writer keeps going with the next one.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::core::{RecordLayout, Row};
use crate::error::{AppResult, DaqError};

/// Creates (or truncates) `path` and writes the two header rows of `layout`.
pub fn create_output(path: &Path, layout: &RecordLayout) -> AppResult<()> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(|source| DaqError::FileOpen {
            path: path.display().to_string(),
            source,
        })?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    for header in layout.header_rows() {
        writer.write_record(&header)?;
    }
    writer.flush()?;
    info!("Created output file '{}'", path.display());
    Ok(())
}

fn append_batch(path: &Path, rows: &[Row]) -> AppResult<()> {
    let file = OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(DaqError::Storage)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    for row in rows {
        writer.write_record(row.to_record())?;
    }
    writer.flush().map_err(DaqError::Storage)?;
    Ok(())
}

/// Counters reported when the writer shuts down.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Rows persisted
    pub written: usize,
    /// Rows lost to failed flushes
    pub dropped: usize,
    /// Successful flushes
    pub batches: usize,
}

/// Single consumer of acquired rows, appending them to one output file in batches.
pub struct StorageWriter {
    rows: mpsc::UnboundedSender<Row>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<WriterStats>,
}

impl StorageWriter {
    /// Starts the drain task for an output file created by [`create_output`].
    pub fn spawn(path: PathBuf, config: &StorageConfig) -> Self {
        let (rows, mut rx) = mpsc::unbounded_channel::<Row>();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let batch_size = config.batch_size.max(1);
        let poll_timeout = config.poll_timeout;

        let task = tokio::spawn(async move {
            let mut stats = WriterStats::default();
            let mut batch: Vec<Row> = Vec::with_capacity(batch_size);
            let mut closing = false;

            let flush = |batch: &mut Vec<Row>, stats: &mut WriterStats| {
                if batch.is_empty() {
                    return;
                }
                match append_batch(&path, batch) {
                    Ok(()) => {
                        stats.written += batch.len();
                        stats.batches += 1;
                        debug!("Flushed {} rows to '{}'", batch.len(), path.display());
                    }
                    Err(e) => {
                        stats.dropped += batch.len();
                        warn!("Dropping {} rows, flush failed: {}", batch.len(), e);
                    }
                }
                batch.clear();
            };

            loop {
                match tokio::time::timeout(poll_timeout, rx.recv()).await {
                    Ok(Some(row)) => batch.push(row),
                    Ok(None) => break,
                    Err(_) => {}
                }
                if batch.len() >= batch_size {
                    flush(&mut batch, &mut stats);
                }
                if !closing {
                    match shutdown_rx.try_recv() {
                        Err(oneshot::error::TryRecvError::Empty) => {}
                        _ => {
                            info!("Storage writer received shutdown signal");
                            closing = true;
                            rx.close();
                        }
                    }
                }
            }

            flush(&mut batch, &mut stats);
            info!(
                "Storage writer finished: {} rows written in {} batches, {} dropped",
                stats.written, stats.batches, stats.dropped
            );
            stats
        });

        Self {
            rows,
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }

    /// Producer side of the row queue.
    pub fn sender(&self) -> mpsc::UnboundedSender<Row> {
        self.rows.clone()
    }

    /// Signals shutdown, waits for the queue to drain and the final flush.
    pub async fn finish(mut self) -> AppResult<WriterStats> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        drop(self.rows);
        self.task
            .await
            .map_err(|e| DaqError::InvalidState(format!("storage writer task failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AcquisitionMode, Quantity, SensorSnapshot};
    use chrono::Local;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::tempdir;

    fn layout() -> RecordLayout {
        RecordLayout::new(
            &[Quantity::Temperature],
            &BTreeMap::new(),
            AcquisitionMode::Continuous { frequency_hz: 5.0 },
            10,
        )
    }

    fn row(layout: &RecordLayout, i: usize) -> Row {
        let line = SensorSnapshot::valid(vec![0.0, 0.0, 0.0, 0.0, i as f64, 0.0]);
        let framed = SensorSnapshot::error(SensorSnapshot::FRAMED_WIDTH);
        layout.build_row(Local::now(), i as f64, 1, &line, &framed)
    }

    fn read_positions(path: &Path) -> Vec<String> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(path)
            .unwrap();
        reader
            .records()
            .skip(2)
            .map(|r| r.unwrap()[1].to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_rows_persist_in_order_for_any_batch_size() {
        let layout = layout();
        for batch_size in [1, 3, 7, 100] {
            let dir = tempdir().unwrap();
            let path = dir.path().join("out.csv");
            create_output(&path, &layout).unwrap();

            let writer = StorageWriter::spawn(
                path.clone(),
                &StorageConfig {
                    batch_size,
                    poll_timeout: Duration::from_millis(10),
                },
            );
            let tx = writer.sender();
            for i in 0..25 {
                tx.send(row(&layout, i)).unwrap();
            }
            drop(tx);
            let stats = writer.finish().await.unwrap();

            assert_eq!(stats.written, 25);
            let expected: Vec<String> = (0..25).map(|i| i.to_string()).collect();
            assert_eq!(read_positions(&path), expected, "batch size {}", batch_size);
        }
    }

    #[tokio::test]
    async fn test_header_rows_match_layout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.csv");
        create_output(&path, &layout()).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "Time,Position,Field number,Temperature,Mode,Frequency");
        assert_eq!(lines[1], "X,X,X,temperature,Continuous,5");
    }

    #[test]
    fn test_create_output_in_missing_directory_fails() {
        let err = create_output(Path::new("/nonexistent/dir/out.csv"), &layout()).unwrap_err();
        assert!(matches!(err, DaqError::FileOpen { .. }));
    }

    #[tokio::test]
    async fn test_failed_flush_drops_batch_and_continues() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("never-created.csv");
        let layout = layout();
        let writer = StorageWriter::spawn(
            path,
            &StorageConfig {
                batch_size: 2,
                poll_timeout: Duration::from_millis(10),
            },
        );
        let tx = writer.sender();
        for i in 0..5 {
            tx.send(row(&layout, i)).unwrap();
        }
        let stats = writer.finish().await.unwrap();
        assert_eq!(stats.written, 0);
        assert_eq!(stats.dropped, 5);
    }
}
