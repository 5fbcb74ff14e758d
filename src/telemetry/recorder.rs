//! # Telemetry Recorder
//!
//! The sink seam the controller writes through, plus the production sink that
//! samples, counts and persists records.
//!
//! # Writer Thread
//!
//! `record` runs on the event path and never touches the disk. Records go
//! through a bounded tokio channel to a dedicated `telemetry-writer` thread,
//! which drains whatever is queued and hands it to the writer as one batch
//! (one SQLite transaction when the mirror is on). When the queue is full the
//! record is dropped and counted in `queue_dropped`.

use super::record::{EventDetails, EventRecord, RecordKind, TelemetryRecord};
use super::writer::{RotationPolicy, TelemetryWriter, WriterConfig};
use crate::types::DatapathId;
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;

/// Most records handed to the writer in one batch
const MAX_BATCH: usize = 512;

/// How long `flush` waits for the queue to drain
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Receiver of telemetry records.
///
/// `record` never fails from the caller's point of view: persistence problems
/// are the sink's to log and count.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, record: TelemetryRecord);

    /// Discrete event for `switch_dpid` at `ts_ms`.
    fn event(&self, switch_dpid: DatapathId, ts_ms: u64, details: EventDetails) {
        self.record(TelemetryRecord::Event(EventRecord::new(
            switch_dpid,
            ts_ms,
            details,
        )));
    }
}

/// Configuration for telemetry recording
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Enable telemetry recording
    pub enabled: bool,

    /// Directory for the record streams
    pub output_dir: String,

    /// Sample rate for packet-in summaries (0.0 - 1.0). 1.0 = record all
    pub packet_in_sample_rate: f64,

    /// Force a flush every N seconds
    pub flush_interval_secs: u64,

    /// Flush after every record
    pub immediate_flush: bool,

    pub rotation: RotationPolicy,

    /// Gzip rotated streams
    pub compress_rotated: bool,

    /// Rotated files kept per stream
    pub max_rotated_files: usize,

    /// Write buffer per stream (bytes)
    pub buffer_size: usize,

    /// Optional SQLite mirror database
    pub sqlite_path: Option<String>,

    /// Records waiting for the writer thread before new ones are dropped
    pub queue_capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig {
            enabled: true,
            output_dir: "telemetry".to_string(),
            packet_in_sample_rate: 1.0,
            flush_interval_secs: 5,
            immediate_flush: false,
            rotation: RotationPolicy::Never,
            compress_rotated: true,
            max_rotated_files: 10,
            buffer_size: 8192,
            sqlite_path: None,
            queue_capacity: 65_536,
        }
    }
}

/// Counters shared between the recorder and its writer thread
#[derive(Default)]
struct RecorderCounters {
    /// Records persisted, per kind
    accepted: Mutex<HashMap<RecordKind, u64>>,

    /// Packet-in summaries skipped by sampling
    sampled_out: AtomicU64,

    /// Records lost to write errors
    write_failures: AtomicU64,

    /// Records lost to a full queue
    queue_dropped: AtomicU64,

    /// Records handed to the queue
    enqueued: AtomicU64,

    /// Records the writer thread is done with, written or failed
    handled: Mutex<u64>,
    drained: Condvar,
}

impl RecorderCounters {
    fn finish_batch(&self, batch: &[TelemetryRecord], results: Vec<Result<(), String>>) {
        let mut failures = 0u64;
        {
            let mut accepted = self.accepted.lock();
            for (record, result) in batch.iter().zip(results) {
                match result {
                    Ok(()) => *accepted.entry(record.kind()).or_insert(0) += 1,
                    Err(e) => {
                        failures += 1;
                        error!(
                            "Failed to persist {} record for switch {}: {}",
                            record.kind(),
                            record.switch_dpid(),
                            e
                        );
                    }
                }
            }
        }
        self.write_failures.fetch_add(failures, Ordering::Relaxed);

        let mut handled = self.handled.lock();
        *handled += batch.len() as u64;
        self.drained.notify_all();
    }
}

/// Thread-safe telemetry recorder backed by a `TelemetryWriter`
pub struct TelemetryRecorder {
    config: TelemetryConfig,

    /// Absent when telemetry is disabled
    writer: Option<Arc<TelemetryWriter>>,

    /// Feeds the writer thread; taken on drop to stop it
    queue: Option<mpsc::Sender<TelemetryRecord>>,
    worker: Option<JoinHandle<()>>,

    counters: Arc<RecorderCounters>,
}

impl TelemetryRecorder {
    /// Creates a recorder and, when enabled, opens the streams and starts the
    /// writer thread.
    ///
    /// # Arguments
    /// * `config` - Output location, sampling, rotation and queue settings
    ///
    /// # Returns
    /// The recorder, or an error if the output directory, a stream, the
    /// SQLite mirror or the writer thread could not be set up. A disabled
    /// recorder touches nothing on disk.
    ///
    /// # Example
    /// ```rust,no_run
    /// use fabric::telemetry::{TelemetryConfig, TelemetryRecorder};
    ///
    /// let recorder = TelemetryRecorder::new(TelemetryConfig {
    ///     output_dir: "/var/lib/fabric/telemetry".to_string(),
    ///     ..TelemetryConfig::default()
    /// })?;
    /// # Ok::<(), String>(())
    /// ```
    pub fn new(config: TelemetryConfig) -> Result<Self, String> {
        let counters = Arc::new(RecorderCounters::default());

        if !config.enabled {
            return Ok(TelemetryRecorder {
                config,
                writer: None,
                queue: None,
                worker: None,
                counters,
            });
        }

        let writer_config = WriterConfig::from_telemetry_config(&config);
        let writer = Arc::new(TelemetryWriter::new(writer_config)?);

        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let worker = {
            let writer = Arc::clone(&writer);
            let counters = Arc::clone(&counters);
            thread::Builder::new()
                .name("telemetry-writer".to_string())
                .spawn(move || run_writer(writer, rx, counters))
                .map_err(|e| format!("Failed to start telemetry writer thread: {}", e))?
        };

        Ok(TelemetryRecorder {
            config,
            writer: Some(writer),
            queue: Some(tx),
            worker: Some(worker),
            counters,
        })
    }

    /// Sampling applies to packet-in summaries only; counters and diagnostics
    /// are always kept.
    fn should_sample_out(&self, record: &TelemetryRecord) -> bool {
        let is_packet_in = matches!(
            record,
            TelemetryRecord::Event(EventRecord {
                details: EventDetails::PacketIn(_),
                ..
            })
        );
        if !is_packet_in || self.config.packet_in_sample_rate >= 1.0 {
            return false;
        }

        use rand::Rng;
        let mut rng = rand::thread_rng();
        rng.gen::<f64>() >= self.config.packet_in_sample_rate
    }

    /// Waits until every record queued so far has been handled by the writer
    /// thread, then flushes the streams.
    ///
    /// Blocks the calling thread; async callers go through `run_flush_loop`.
    ///
    /// # Returns
    /// `Ok(())` once the streams are flushed, or an error if the queue did
    /// not drain in time or a stream could not be flushed.
    ///
    /// # Example
    /// ```rust,no_run
    /// # use fabric::telemetry::{TelemetryConfig, TelemetryRecorder};
    /// let recorder = TelemetryRecorder::new(TelemetryConfig::default())?;
    /// recorder.flush()?;
    /// # Ok::<(), String>(())
    /// ```
    pub fn flush(&self) -> Result<(), String> {
        let writer = match &self.writer {
            Some(writer) => writer,
            None => return Ok(()),
        };

        let target = self.counters.enqueued.load(Ordering::Acquire);
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        {
            let mut handled = self.counters.handled.lock();
            while *handled < target {
                let now = Instant::now();
                if now >= deadline {
                    return Err(format!(
                        "Telemetry queue did not drain: {} of {} records handled",
                        *handled, target
                    ));
                }
                self.counters.drained.wait_for(&mut handled, deadline - now);
            }
        }

        writer.flush()
    }

    /// Flushes every `flush_interval_secs` until shutdown, then once more.
    ///
    /// Each flush runs on the blocking pool so a slow disk never stalls the
    /// runtime.
    ///
    /// # Arguments
    /// * `shutdown` - Loop exits when this flips to `true` or its sender drops
    ///
    /// # Example
    /// ```rust,no_run
    /// # use std::sync::Arc;
    /// # use fabric::telemetry::{TelemetryConfig, TelemetryRecorder};
    /// # async fn run() -> Result<(), String> {
    /// let recorder = Arc::new(TelemetryRecorder::new(TelemetryConfig::default())?);
    /// let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    /// let flush_task = tokio::spawn(recorder.clone().run_flush_loop(shutdown_rx));
    ///
    /// shutdown_tx.send(true).ok();
    /// flush_task.await.ok();
    /// # Ok(())
    /// # }
    /// ```
    pub async fn run_flush_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if self.writer.is_none() {
            return;
        }

        let period = Duration::from_secs(self.config.flush_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = Arc::clone(&self).flush_blocking().await {
                        error!("Telemetry flush failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = Arc::clone(&self).flush_blocking().await {
            error!("Final telemetry flush failed: {}", e);
        }
        info!("Telemetry flush loop stopped");
    }

    async fn flush_blocking(self: Arc<Self>) -> Result<(), String> {
        tokio::task::spawn_blocking(move || self.flush())
            .await
            .map_err(|e| format!("Telemetry flush task failed: {}", e))?
    }

    /// Get telemetry statistics
    pub fn stats(&self) -> TelemetryStats {
        TelemetryStats {
            accepted: self.counters.accepted.lock().clone(),
            sampled_out: self.counters.sampled_out.load(Ordering::Relaxed),
            write_failures: self.counters.write_failures.load(Ordering::Relaxed),
            queue_dropped: self.counters.queue_dropped.load(Ordering::Relaxed),
            packet_in_sample_rate: self.config.packet_in_sample_rate,
        }
    }

    /// Check if telemetry is enabled
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn writer(&self) -> Option<&Arc<TelemetryWriter>> {
        self.writer.as_ref()
    }
}

impl TelemetrySink for TelemetryRecorder {
    fn record(&self, record: TelemetryRecord) {
        let queue = match &self.queue {
            Some(queue) => queue,
            None => return,
        };

        if self.should_sample_out(&record) {
            self.counters.sampled_out.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match queue.try_send(record) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::AcqRel);
            }
            Err(e) => match e {
                TrySendError::Full(record) => {
                    let dropped = self.counters.queue_dropped.fetch_add(1, Ordering::Relaxed);
                    if dropped == 0 {
                        warn!(
                            "Telemetry queue full, dropping {} record for switch {}",
                            record.kind(),
                            record.switch_dpid()
                        );
                    }
                }
                TrySendError::Closed(record) => {
                    self.counters.write_failures.fetch_add(1, Ordering::Relaxed);
                    error!(
                        "Telemetry writer stopped, lost {} record for switch {}",
                        record.kind(),
                        record.switch_dpid()
                    );
                }
            },
        }
    }
}

impl Drop for TelemetryRecorder {
    fn drop(&mut self) {
        // Closing the queue lets the thread drain what is left and exit
        self.queue.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Telemetry writer thread panicked");
            }
        }
    }
}

/// Body of the writer thread: batch whatever is queued, write, repeat.
fn run_writer(
    writer: Arc<TelemetryWriter>,
    mut queue: mpsc::Receiver<TelemetryRecord>,
    counters: Arc<RecorderCounters>,
) {
    debug!("Telemetry writer thread started");
    let mut batch = Vec::with_capacity(MAX_BATCH);

    while let Some(first) = queue.blocking_recv() {
        batch.push(first);
        while batch.len() < MAX_BATCH {
            match queue.try_recv() {
                Ok(record) => batch.push(record),
                Err(_) => break,
            }
        }

        let results = writer.write_batch(&batch);
        counters.finish_batch(&batch, results);
        batch.clear();
    }

    if let Err(e) = writer.flush() {
        error!("Telemetry flush on writer exit failed: {}", e);
    }
    debug!("Telemetry writer thread stopped");
}

/// Telemetry statistics
#[derive(Debug, Clone, Default)]
pub struct TelemetryStats {
    pub accepted: HashMap<RecordKind, u64>,
    pub sampled_out: u64,
    pub write_failures: u64,
    pub queue_dropped: u64,
    pub packet_in_sample_rate: f64,
}

impl TelemetryStats {
    pub fn total_accepted(&self) -> u64 {
        self.accepted.values().sum()
    }

    pub fn accepted_of(&self, kind: RecordKind) -> u64 {
        self.accepted.get(&kind).copied().unwrap_or(0)
    }
}

// ================================================================================================
// IN-MEMORY SINK
// ================================================================================================

/// Sink that keeps every record in memory, in arrival order.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<TelemetryRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TelemetryRecord> {
        self.records.lock().clone()
    }

    pub fn of_kind(&self, kind: RecordKind) -> Vec<TelemetryRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn events(&self) -> Vec<EventRecord> {
        self.records
            .lock()
            .iter()
            .filter_map(|r| r.as_event().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl TelemetrySink for MemorySink {
    fn record(&self, record: TelemetryRecord) {
        self.records.lock().push(record);
    }
}
