//! # Telemetry Writer
//!
//! Append-only, rotation-capable JSON-lines streams, one per record kind,
//! with an optional SQLite mirror.
//!
//! Layout of `base_dir`:
//! - `<kind>.jsonl`: the live stream
//! - `<kind>.jsonl.<unix_ms>-<seq>`: rotated, `.gz` appended when compressed

use super::recorder::TelemetryConfig;
use super::record::{RecordKind, TelemetryRecord};
use crate::types::{now_ms, DatapathId};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::UNIX_EPOCH;

const MS_PER_HOUR: u64 = 3_600_000;
const MS_PER_DAY: u64 = 86_400_000;

/// Writer configuration
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Directory holding every stream
    pub base_dir: String,

    pub rotation: RotationPolicy,

    /// Enable compression for rotated streams
    pub compress_rotated: bool,

    /// Rotated files kept per stream
    pub max_rotated_files: usize,

    /// Buffer size for writes (bytes)
    pub buffer_size: usize,

    /// Enable immediate flush (disable buffering)
    pub immediate_flush: bool,

    /// Mirror every record into this SQLite database
    pub sqlite_path: Option<String>,
}

/// File rotation policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationPolicy {
    /// Rotate when a stream exceeds size (bytes)
    BySize(u64),

    /// Rotate every N seconds
    ByTime(u64),

    /// Rotate daily at midnight UTC
    Daily,

    /// Rotate hourly
    Hourly,

    /// No rotation
    Never,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            base_dir: "telemetry".to_string(),
            rotation: RotationPolicy::BySize(100 * 1024 * 1024), // 100 MB
            compress_rotated: true,
            max_rotated_files: 10,
            buffer_size: 8192,
            immediate_flush: false,
            sqlite_path: None,
        }
    }
}

impl WriterConfig {
    pub fn from_telemetry_config(config: &TelemetryConfig) -> Self {
        WriterConfig {
            base_dir: config.output_dir.clone(),
            rotation: config.rotation.clone(),
            compress_rotated: config.compress_rotated,
            max_rotated_files: config.max_rotated_files,
            buffer_size: config.buffer_size,
            immediate_flush: config.immediate_flush,
            sqlite_path: config.sqlite_path.clone(),
        }
    }
}

/// Thread-safe multi-stream writer
pub struct TelemetryWriter {
    config: WriterConfig,
    base_path: PathBuf,
    streams: HashMap<RecordKind, Mutex<Option<StreamFile>>>,
    sqlite: Option<Mutex<Connection>>,
    rotation_seq: AtomicU64,
}

struct StreamFile {
    writer: BufWriter<File>,
    path: PathBuf,
    created_at_ms: u64,
    bytes_written: u64,
    records_written: u64,
}

impl TelemetryWriter {
    /// Create the output directory, open every stream, and the mirror if configured
    pub fn new(config: WriterConfig) -> Result<Self, String> {
        fs::create_dir_all(&config.base_dir)
            .map_err(|e| format!("Failed to create telemetry directory: {}", e))?;

        let base_path = PathBuf::from(&config.base_dir);

        let sqlite = config
            .sqlite_path
            .as_ref()
            .map(|path| open_sqlite(Path::new(path)))
            .transpose()?;

        let streams = RecordKind::ALL
            .iter()
            .map(|kind| (*kind, Mutex::new(None)))
            .collect();

        let writer = TelemetryWriter {
            config,
            base_path,
            streams,
            sqlite,
            rotation_seq: AtomicU64::new(0),
        };

        for kind in RecordKind::ALL {
            writer.rotate_if_needed(kind, true)?;
            // A stream left over from an earlier run may already be due
            writer.rotate_if_needed(kind, false)?;
        }

        Ok(writer)
    }

    /// Append one record to its stream, and to the mirror when configured
    pub fn write(&self, record: &TelemetryRecord) -> Result<(), String> {
        self.write_batch(std::slice::from_ref(record))
            .into_iter()
            .next()
            .unwrap_or(Ok(()))
    }

    /// Append a batch to the streams, then mirror it in one SQLite transaction.
    ///
    /// Returns one result per record, in input order. A failed mirror
    /// transaction fails every record it carried.
    pub fn write_batch(&self, records: &[TelemetryRecord]) -> Vec<Result<(), String>> {
        let mut results = Vec::with_capacity(records.len());
        let mut rows = Vec::with_capacity(records.len());

        for (idx, record) in records.iter().enumerate() {
            match self.append(record) {
                Ok(json) => {
                    rows.push((idx, json));
                    results.push(Ok(()));
                }
                Err(e) => results.push(Err(e)),
            }
        }

        if let Err(e) = self.mirror(records, &rows) {
            for (idx, _) in &rows {
                results[*idx] = Err(e.clone());
            }
        }

        results
    }

    /// Append one JSON line, returning the line without its newline
    fn append(&self, record: &TelemetryRecord) -> Result<String, String> {
        let json = serde_json::to_string(record)
            .map_err(|e| format!("Failed to serialize {} record: {}", record.kind(), e))?;

        let kind = record.kind();
        let line = format!("{}\n", json);
        let bytes = line.as_bytes();

        let stream = self.stream(kind)?;
        let mut needs_rotation = false;
        {
            let mut file_guard = stream.lock();
            if file_guard.is_none() {
                *file_guard = Some(self.open_stream(kind)?);
            }

            if let Some(ref mut file) = *file_guard {
                file.writer
                    .write_all(bytes)
                    .map_err(|e| format!("Failed to write to {} stream: {}", kind, e))?;

                if self.config.immediate_flush {
                    file.writer
                        .flush()
                        .map_err(|e| format!("Failed to flush {} stream: {}", kind, e))?;
                }

                file.bytes_written += bytes.len() as u64;
                file.records_written += 1;
                needs_rotation = self.should_rotate(file);
            }
        }

        if needs_rotation {
            self.rotate_if_needed(kind, false)?;
        }

        Ok(json)
    }

    fn mirror(&self, records: &[TelemetryRecord], rows: &[(usize, String)]) -> Result<(), String> {
        let sqlite_mutex = match self.sqlite {
            Some(ref sqlite_mutex) if !rows.is_empty() => sqlite_mutex,
            _ => return Ok(()),
        };

        let mut conn_guard = sqlite_mutex.lock();
        let tx = conn_guard
            .transaction()
            .map_err(|e| format!("Failed to begin sqlite transaction: {}", e))?;
        {
            let mut insert = tx
                .prepare_cached(
                    "INSERT INTO telemetry (kind, switch_dpid, ts_ms, record_json)
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .map_err(|e| format!("Failed to prepare telemetry insert: {}", e))?;

            for (idx, json) in rows {
                let record = &records[*idx];
                insert
                    .execute(params![
                        record.kind().as_str(),
                        dpid_key(record.switch_dpid()),
                        record.ts_ms() as i64,
                        json
                    ])
                    .map_err(|e| format!("Failed to insert telemetry into sqlite: {}", e))?;
            }
        }
        tx.commit()
            .map_err(|e| format!("Failed to commit telemetry batch: {}", e))
    }

    /// Flush pending writes on every stream
    pub fn flush(&self) -> Result<(), String> {
        for (kind, stream) in &self.streams {
            if let Some(ref mut file) = *stream.lock() {
                file.writer
                    .flush()
                    .map_err(|e| format!("Failed to flush {} stream: {}", kind, e))?;
            }
        }
        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_path
    }

    fn stream(&self, kind: RecordKind) -> Result<&Mutex<Option<StreamFile>>, String> {
        self.streams
            .get(&kind)
            .ok_or_else(|| format!("No stream for record kind {}", kind))
    }

    fn should_rotate(&self, file: &StreamFile) -> bool {
        let now = now_ms();
        match self.config.rotation {
            RotationPolicy::BySize(max_bytes) => file.bytes_written >= max_bytes,
            RotationPolicy::ByTime(seconds) => {
                now.saturating_sub(file.created_at_ms) >= seconds.saturating_mul(1000)
            }
            RotationPolicy::Daily => now / MS_PER_DAY > file.created_at_ms / MS_PER_DAY,
            RotationPolicy::Hourly => now / MS_PER_HOUR > file.created_at_ms / MS_PER_HOUR,
            RotationPolicy::Never => false,
        }
    }

    /// Rotate one stream if its policy says so, or unconditionally with `force_create`
    fn rotate_if_needed(&self, kind: RecordKind, force_create: bool) -> Result<(), String> {
        let mut file_guard = self.stream(kind)?.lock();

        let should_rotate = match *file_guard {
            Some(ref file) => force_create || self.should_rotate(file),
            None => true,
        };

        if !should_rotate {
            return Ok(());
        }

        if let Some(mut old_file) = file_guard.take() {
            old_file
                .writer
                .flush()
                .map_err(|e| format!("Failed to flush before rotation: {}", e))?;

            let rotated_path = self.rotated_path(kind);
            fs::rename(&old_file.path, &rotated_path)
                .map_err(|e| format!("Failed to rotate {} stream: {}", kind, e))?;

            if self.config.compress_rotated {
                compress_file(&rotated_path)?;
            }

            self.cleanup_old_files(kind)?;
        }

        *file_guard = Some(self.open_stream(kind)?);
        Ok(())
    }

    fn open_stream(&self, kind: RecordKind) -> Result<StreamFile, String> {
        let path = self.base_path.join(kind.stream_name());
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| format!("Failed to open {}: {}", path.display(), e))?;
        let metadata = file
            .metadata()
            .map_err(|e| format!("Failed to stat {}: {}", path.display(), e))?;
        let bytes_written = metadata.len();

        // A reopened stream keeps the age of its last write
        let created_at_ms = if bytes_written > 0 {
            metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
                .unwrap_or_else(now_ms)
        } else {
            now_ms()
        };

        Ok(StreamFile {
            writer: BufWriter::with_capacity(self.config.buffer_size, file),
            path,
            created_at_ms,
            bytes_written,
            records_written: 0,
        })
    }

    fn rotated_path(&self, kind: RecordKind) -> PathBuf {
        let seq = self.rotation_seq.fetch_add(1, Ordering::Relaxed);
        let filename = format!("{}.{}-{:06}", kind.stream_name(), now_ms(), seq);
        self.base_path.join(filename)
    }

    /// Keep only the newest `max_rotated_files` rotated files of one stream
    fn cleanup_old_files(&self, kind: RecordKind) -> Result<(), String> {
        let mut rotated = rotated_files(&self.base_path, kind)?;

        if rotated.len() > self.config.max_rotated_files {
            let excess = rotated.len() - self.config.max_rotated_files;
            for path in rotated.drain(..excess) {
                fs::remove_file(&path).ok();
            }
        }

        Ok(())
    }

    /// Per-stream counters for the live files
    pub fn stats(&self) -> Vec<StreamStats> {
        let mut stats: Vec<StreamStats> = self
            .streams
            .iter()
            .filter_map(|(kind, stream)| {
                stream.lock().as_ref().map(|file| StreamStats {
                    kind: *kind,
                    path: file.path.clone(),
                    bytes_written: file.bytes_written,
                    records_written: file.records_written,
                    created_at_ms: file.created_at_ms,
                })
            })
            .collect();
        stats.sort_by_key(|s| s.kind);
        stats
    }
}

impl Drop for TelemetryWriter {
    fn drop(&mut self) {
        self.flush().ok();
    }
}

fn open_sqlite(path: &Path) -> Result<Mutex<Connection>, String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create sqlite parent dir: {}", e))?;
    }

    let conn = Connection::open(path).map_err(|e| format!("Failed to open sqlite db: {}", e))?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS telemetry (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            switch_dpid TEXT NOT NULL,
            ts_ms INTEGER NOT NULL,
            record_json TEXT NOT NULL
        )",
        [],
    )
    .map_err(|e| format!("Failed to create telemetry table: {}", e))?;

    Ok(Mutex::new(conn))
}

/// Key a datapath id is stored under in the SQLite mirror.
///
/// Fixed-width hex, so the full u64 range survives and ids sort numerically.
pub fn dpid_key(id: DatapathId) -> String {
    format!("{:016x}", id)
}

/// Compress a rotated file (gzip) and remove the original
fn compress_file(path: &Path) -> Result<PathBuf, String> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let input =
        fs::read(path).map_err(|e| format!("Failed to read file for compression: {}", e))?;

    let mut output_name = path.as_os_str().to_owned();
    output_name.push(".gz");
    let output_path = PathBuf::from(output_name);
    let output_file = File::create(&output_path)
        .map_err(|e| format!("Failed to create compressed file: {}", e))?;

    let mut encoder = GzEncoder::new(output_file, Compression::default());
    encoder
        .write_all(&input)
        .map_err(|e| format!("Failed to compress: {}", e))?;
    encoder
        .finish()
        .map_err(|e| format!("Failed to finish compression: {}", e))?;

    fs::remove_file(path).ok();

    Ok(output_path)
}

/// Rotated files of one stream, oldest first
pub fn rotated_files(dir: &Path, kind: RecordKind) -> Result<Vec<PathBuf>, String> {
    let prefix = format!("{}.", kind.stream_name());
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| format!("Failed to read telemetry directory: {}", e))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|name| name.starts_with(&prefix))
                .unwrap_or(false)
        })
        .collect();

    // Names embed <unix_ms>-<seq>, so lexical order is rotation order.
    files.sort();
    Ok(files)
}

/// Statistics for one live stream
#[derive(Debug, Clone)]
pub struct StreamStats {
    pub kind: RecordKind,
    pub path: PathBuf,
    pub bytes_written: u64,
    pub records_written: u64,
    pub created_at_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::record::{EventDetails, EventRecord, PortStatsRecord};
    use crate::openflow::PortStats;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> WriterConfig {
        WriterConfig {
            base_dir: dir.path().to_string_lossy().to_string(),
            rotation: RotationPolicy::Never,
            immediate_flush: true,
            ..Default::default()
        }
    }

    fn port_record(port_no: u32) -> TelemetryRecord {
        TelemetryRecord::PortStats(PortStatsRecord::new(
            1,
            now_ms(),
            &PortStats {
                port_no,
                rx_packets: 10,
                ..Default::default()
            },
        ))
    }

    #[test]
    fn test_creates_one_stream_per_kind() {
        let dir = TempDir::new().unwrap();
        let writer = TelemetryWriter::new(config(&dir)).unwrap();
        for kind in RecordKind::ALL {
            assert!(dir.path().join(kind.stream_name()).exists());
        }
        assert_eq!(writer.stats().len(), 5);
    }

    #[test]
    fn test_records_go_to_their_stream() {
        let dir = TempDir::new().unwrap();
        let writer = TelemetryWriter::new(config(&dir)).unwrap();

        writer.write(&port_record(1)).unwrap();
        writer.write(&port_record(2)).unwrap();
        writer
            .write(&TelemetryRecord::Event(EventRecord::new(
                1,
                now_ms(),
                EventDetails::SwitchConnected,
            )))
            .unwrap();

        let ports = fs::read_to_string(dir.path().join("port_stats.jsonl")).unwrap();
        assert_eq!(ports.lines().count(), 2);
        let events = fs::read_to_string(dir.path().join("events.jsonl")).unwrap();
        assert!(events.contains("switch_connected"));
    }

    #[test]
    fn test_size_rotation_compresses_and_prunes() {
        let dir = TempDir::new().unwrap();
        let writer = TelemetryWriter::new(WriterConfig {
            rotation: RotationPolicy::BySize(1),
            max_rotated_files: 2,
            ..config(&dir)
        })
        .unwrap();

        for port in 0..5 {
            writer.write(&port_record(port)).unwrap();
        }

        let rotated = rotated_files(dir.path(), RecordKind::PortStats).unwrap();
        assert_eq!(rotated.len(), 2);
        assert!(rotated
            .iter()
            .all(|p| p.extension().and_then(|e| e.to_str()) == Some("gz")));
    }

    #[test]
    fn test_sqlite_mirror() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("mirror").join("telemetry.db");
        let writer = TelemetryWriter::new(WriterConfig {
            sqlite_path: Some(db.to_string_lossy().to_string()),
            ..config(&dir)
        })
        .unwrap();

        writer.write(&port_record(3)).unwrap();
        writer.write(&port_record(4)).unwrap();

        let conn = Connection::open(&db).unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM telemetry WHERE kind = 'port_stats' AND switch_dpid = ?1",
                params![dpid_key(1)],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_sqlite_mirror_keeps_full_dpid_range() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("telemetry.db");
        let writer = TelemetryWriter::new(WriterConfig {
            sqlite_path: Some(db.to_string_lossy().to_string()),
            ..config(&dir)
        })
        .unwrap();

        let high = u64::MAX - 1;
        let results = writer.write_batch(&[
            TelemetryRecord::Event(EventRecord::new(high, 1, EventDetails::SwitchConnected)),
            TelemetryRecord::Event(EventRecord::new(1 << 63, 2, EventDetails::SwitchConnected)),
            port_record(7),
        ]);
        assert!(results.iter().all(|r| r.is_ok()));

        let conn = Connection::open(&db).unwrap();
        let mut stmt = conn
            .prepare("SELECT switch_dpid FROM telemetry ORDER BY switch_dpid")
            .unwrap();
        let keys: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(
            keys,
            vec![
                "0000000000000001".to_string(),
                "8000000000000000".to_string(),
                "fffffffffffffffe".to_string(),
            ]
        );
        assert_eq!(u64::from_str_radix(&keys[2], 16).unwrap(), high);
    }

    #[test]
    fn test_batch_mirrors_every_record() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("telemetry.db");
        let writer = TelemetryWriter::new(WriterConfig {
            sqlite_path: Some(db.to_string_lossy().to_string()),
            immediate_flush: false,
            ..config(&dir)
        })
        .unwrap();

        let batch: Vec<TelemetryRecord> = (0..500).map(port_record).collect();
        let results = writer.write_batch(&batch);
        assert_eq!(results.len(), 500);
        assert!(results.iter().all(|r| r.is_ok()));
        writer.flush().unwrap();

        let conn = Connection::open(&db).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM telemetry", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 500);
        let ports = fs::read_to_string(dir.path().join("port_stats.jsonl")).unwrap();
        assert_eq!(ports.lines().count(), 500);
    }

    fn age_stream(dir: &TempDir, kind: RecordKind, days: u64) {
        let path = dir.path().join(kind.stream_name());
        fs::write(&path, "{\"kind\":\"event\"}\n").unwrap();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        let old = std::time::SystemTime::now() - std::time::Duration::from_secs(days * 86_400);
        file.set_modified(old).unwrap();
    }

    #[test]
    fn test_reopened_stream_keeps_its_age() {
        let dir = TempDir::new().unwrap();
        age_stream(&dir, RecordKind::Event, 3);

        let writer = TelemetryWriter::new(config(&dir)).unwrap();
        let events = writer
            .stats()
            .into_iter()
            .find(|s| s.kind == RecordKind::Event)
            .unwrap();
        assert!(now_ms() - events.created_at_ms >= 2 * MS_PER_DAY);
        assert!(events.bytes_written > 0);
    }

    #[test]
    fn test_stale_stream_rotates_on_open() {
        let dir = TempDir::new().unwrap();
        age_stream(&dir, RecordKind::Event, 2);

        let _writer = TelemetryWriter::new(WriterConfig {
            rotation: RotationPolicy::Daily,
            compress_rotated: false,
            ..config(&dir)
        })
        .unwrap();

        let rotated = rotated_files(dir.path(), RecordKind::Event).unwrap();
        assert_eq!(rotated.len(), 1);
        assert!(fs::read_to_string(&rotated[0]).unwrap().contains("event"));
        let live = fs::read_to_string(dir.path().join("events.jsonl")).unwrap();
        assert!(live.is_empty());

        // Fresh streams stay put
        assert!(rotated_files(dir.path(), RecordKind::PortStats)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_rotation_policy_config_shape() {
        let policy: RotationPolicy = serde_json::from_str(r#"{"by_size": 1024}"#).unwrap();
        assert_eq!(policy, RotationPolicy::BySize(1024));
        let hourly: RotationPolicy = serde_json::from_str(r#""hourly""#).unwrap();
        assert_eq!(hourly, RotationPolicy::Hourly);
    }
}
