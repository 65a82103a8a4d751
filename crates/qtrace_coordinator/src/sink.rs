//! Per-OU output sinks.
//!
//! One CSV file per operating unit, header = feature names ‖ metric names.
//! Each sink owns a writer thread fed by an unbounded queue; close sends a
//! poison pill and joins, so every queued record lands before shutdown.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::Mutex;
use std::thread::JoinHandle;

use anyhow::Context;
use qtrace_collector::schema::{CollectorSchema, OuSchema};

pub struct OuSink {
    name: String,
    tx: Mutex<Option<Sender<Option<String>>>>,
    writer: Mutex<Option<JoinHandle<anyhow::Result<()>>>>,
    /// Records that never reached this sink: resets, collector map
    /// overflows, ring overflows, markers for unknown backends, and
    /// undecodable payloads.
    dropped: AtomicU64,
}

impl OuSink {
    fn spawn(outdir: &Path, ou: &OuSchema) -> anyhow::Result<Self> {
        let path = outdir.join(format!("{}.csv", ou.name));
        let file = File::create(&path)
            .with_context(|| format!("create sink file {}", path.display()))?;
        let mut writer = BufWriter::new(file);

        let mut header: Vec<String> = ou
            .feature_columns()
            .into_iter()
            .map(str::to_string)
            .collect();
        header.extend(CollectorSchema::metric_columns().into_iter().map(str::to_string));
        writeln!(writer, "{}", header.join(",")).context("write sink header")?;

        let (tx, rx) = channel::<Option<String>>();
        let name = ou.name.clone();
        let handle = std::thread::Builder::new()
            .name(format!("sink-{name}"))
            .spawn(move || -> anyhow::Result<()> {
                while let Ok(message) = rx.recv() {
                    match message {
                        Some(row) => writeln!(writer, "{row}").context("write sink row")?,
                        // Poison pill: all producers have shut down.
                        None => break,
                    }
                }
                writer.flush().context("flush sink")
            })
            .context("spawn sink thread")?;

        Ok(Self {
            name: ou.name.clone(),
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(handle)),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn write(&self, row: String) {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match tx.as_ref() {
            Some(tx) if tx.send(Some(row)).is_ok() => {}
            _ => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn add_drops(&self, count: u64) {
        if count > 0 {
            self.dropped.fetch_add(count, Ordering::Relaxed);
        }
    }

    fn close(&self) -> anyhow::Result<()> {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(None);
        }
        let handle = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("sink thread panicked"))??;
        }
        let dropped = self.dropped.load(Ordering::Relaxed);
        if dropped > 0 {
            tracing::warn!(ou = %self.name, dropped, "sink lost records");
        }
        Ok(())
    }
}

/// One sink per OU, indexed by `ou_index`.
pub struct SinkSet {
    sinks: Vec<OuSink>,
}

impl SinkSet {
    pub fn create(outdir: &Path, schema: &CollectorSchema) -> anyhow::Result<Self> {
        std::fs::create_dir_all(outdir)
            .with_context(|| format!("create output directory {}", outdir.display()))?;
        let mut sinks = Vec::with_capacity(schema.ous.len());
        for ou in &schema.ous {
            sinks.push(OuSink::spawn(outdir, ou)?);
        }
        Ok(Self { sinks })
    }

    pub fn write(&self, ou_index: u32, row: String) {
        if let Some(sink) = self.sinks.get(ou_index as usize) {
            sink.write(row);
        }
    }

    pub fn add_drops(&self, ou_index: u32, count: u64) {
        if let Some(sink) = self.sinks.get(ou_index as usize) {
            sink.add_drops(count);
        }
    }

    /// Exported drop count for one OU.
    pub fn drops(&self, ou_index: u32) -> u64 {
        self.sinks
            .get(ou_index as usize)
            .map(|sink| sink.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Close every sink; the first failure wins but all sinks are joined.
    pub fn close_all(&self) -> anyhow::Result<()> {
        let mut result = Ok(());
        for sink in &self.sinks {
            if let Err(err) = sink.close() {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qtrace_collector::schema::{FieldKind, FieldSpec};

    fn schema() -> CollectorSchema {
        CollectorSchema::new(vec![OuSchema {
            ou_index: 0,
            name: "ExecSeqScan".to_string(),
            features: vec![
                FieldSpec::new("query_id", FieldKind::Int64),
                FieldSpec::new("ptr", FieldKind::Opaque),
            ],
        }])
    }

    #[test]
    fn header_then_rows_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let schema = schema();
        let sinks = SinkSet::create(dir.path(), &schema).unwrap();
        sinks.write(0, "1,2".to_string());
        sinks.write(0, "3,4".to_string());
        sinks.close_all().unwrap();

        let contents = std::fs::read_to_string(dir.path().join("ExecSeqScan.csv")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert!(lines[0].starts_with("query_id,start_time"));
        assert!(lines[0].ends_with("cpu_id,pid"));
        assert_eq!(&lines[1..], &["1,2", "3,4"]);
    }

    #[test]
    fn writes_after_close_count_as_drops() {
        let dir = tempfile::tempdir().unwrap();
        let schema = schema();
        let sinks = SinkSet::create(dir.path(), &schema).unwrap();
        sinks.close_all().unwrap();
        sinks.write(0, "late".to_string());
        assert_eq!(sinks.drops(0), 1);
    }

    #[test]
    fn routed_drop_counts_are_queryable() {
        let dir = tempfile::tempdir().unwrap();
        let schema = schema();
        let sinks = SinkSet::create(dir.path(), &schema).unwrap();
        sinks.add_drops(0, 3);
        sinks.add_drops(0, 2);
        assert_eq!(sinks.drops(0), 5);
        assert_eq!(sinks.drops(9), 0, "unknown OU reads as zero");
        sinks.close_all().unwrap();
    }
}
