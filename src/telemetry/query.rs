//! # Telemetry Query
//!
//! Read-back over the JSON-lines streams, rotated (and gzipped) files
//! included. Used by `telemetry_viewer` and by tests.

use super::record::{EventType, RecordKind, TelemetryRecord};
use super::writer::rotated_files;
use crate::types::DatapathId;
use flate2::read::GzDecoder;
use log::warn;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

/// Filter criteria; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub kind: Option<RecordKind>,
    pub switch_dpid: Option<DatapathId>,
    /// Only meaningful for event records
    pub event_type: Option<EventType>,
    pub start_time_ms: Option<u64>,
    pub end_time_ms: Option<u64>,
    pub limit: Option<usize>,
}

impl QueryFilter {
    fn matches(&self, record: &TelemetryRecord) -> bool {
        if let Some(dpid) = self.switch_dpid {
            if record.switch_dpid() != dpid {
                return false;
            }
        }
        if let Some(event_type) = self.event_type {
            if record.event_type() != Some(event_type) {
                return false;
            }
        }
        if let Some(start) = self.start_time_ms {
            if record.ts_ms() < start {
                return false;
            }
        }
        if let Some(end) = self.end_time_ms {
            if record.ts_ms() > end {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    /// Newest first
    pub records: Vec<TelemetryRecord>,
    /// Matches before `limit` was applied
    pub total_matched: usize,
}

#[derive(Debug, Clone, Default)]
pub struct TelemetryStatistics {
    pub per_kind: BTreeMap<RecordKind, u64>,
    pub per_switch: BTreeMap<DatapathId, u64>,
    pub per_event_type: BTreeMap<String, u64>,
    pub first_ts_ms: Option<u64>,
    pub last_ts_ms: Option<u64>,
    /// Lines that did not parse as records
    pub skipped_lines: u64,
}

impl TelemetryStatistics {
    pub fn total_records(&self) -> u64 {
        self.per_kind.values().sum()
    }
}

pub struct TelemetryQuery {
    dir: PathBuf,
}

impl TelemetryQuery {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        TelemetryQuery {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Every record of one kind in write order. Missing streams read as empty.
    pub fn load(&self, kind: RecordKind) -> Result<Vec<TelemetryRecord>, String> {
        let (records, _) = self.load_counting(kind)?;
        Ok(records)
    }

    fn load_counting(&self, kind: RecordKind) -> Result<(Vec<TelemetryRecord>, u64), String> {
        if !self.dir.exists() {
            return Err(format!(
                "Telemetry directory {} does not exist",
                self.dir.display()
            ));
        }

        let mut files = rotated_files(&self.dir, kind)?;
        let live = self.dir.join(kind.stream_name());
        if live.exists() {
            files.push(live);
        }

        let mut records = Vec::new();
        let mut skipped = 0u64;
        for path in files {
            skipped += read_stream(&path, &mut records)?;
        }
        Ok((records, skipped))
    }

    pub fn query(&self, filter: &QueryFilter) -> Result<QueryResult, String> {
        let kinds: Vec<RecordKind> = match filter.kind {
            Some(kind) => vec![kind],
            None if filter.event_type.is_some() => vec![RecordKind::Event],
            None => RecordKind::ALL.to_vec(),
        };

        let mut matched = Vec::new();
        for kind in kinds {
            matched.extend(self.load(kind)?.into_iter().filter(|r| filter.matches(r)));
        }

        // Stable sort keeps write order among equal timestamps.
        matched.sort_by_key(|r| std::cmp::Reverse(r.ts_ms()));
        let total_matched = matched.len();
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }

        Ok(QueryResult {
            records: matched,
            total_matched,
        })
    }

    pub fn recent(&self, kind: RecordKind, limit: usize) -> Result<Vec<TelemetryRecord>, String> {
        let filter = QueryFilter {
            kind: Some(kind),
            limit: Some(limit),
            ..Default::default()
        };
        Ok(self.query(&filter)?.records)
    }

    pub fn by_switch(
        &self,
        switch_dpid: DatapathId,
        kind: Option<RecordKind>,
        limit: Option<usize>,
    ) -> Result<Vec<TelemetryRecord>, String> {
        let filter = QueryFilter {
            kind,
            switch_dpid: Some(switch_dpid),
            limit,
            ..Default::default()
        };
        Ok(self.query(&filter)?.records)
    }

    pub fn events(
        &self,
        event_type: Option<EventType>,
        limit: Option<usize>,
    ) -> Result<Vec<TelemetryRecord>, String> {
        let filter = QueryFilter {
            kind: Some(RecordKind::Event),
            event_type,
            limit,
            ..Default::default()
        };
        Ok(self.query(&filter)?.records)
    }

    pub fn statistics(&self) -> Result<TelemetryStatistics, String> {
        let mut stats = TelemetryStatistics::default();

        for kind in RecordKind::ALL {
            let (records, skipped) = self.load_counting(kind)?;
            stats.skipped_lines += skipped;

            for record in &records {
                *stats.per_kind.entry(kind).or_insert(0) += 1;
                *stats.per_switch.entry(record.switch_dpid()).or_insert(0) += 1;
                if let Some(event_type) = record.event_type() {
                    *stats
                        .per_event_type
                        .entry(event_type.to_string())
                        .or_insert(0) += 1;
                }

                let ts = record.ts_ms();
                stats.first_ts_ms = Some(stats.first_ts_ms.map_or(ts, |t| t.min(ts)));
                stats.last_ts_ms = Some(stats.last_ts_ms.map_or(ts, |t| t.max(ts)));
            }
        }

        Ok(stats)
    }
}

/// Appends the records of one file; returns the number of unparseable lines.
fn read_stream(path: &Path, records: &mut Vec<TelemetryRecord>) -> Result<u64, String> {
    let file =
        File::open(path).map_err(|e| format!("Failed to open {}: {}", path.display(), e))?;

    let reader: Box<dyn Read> = if path.extension().and_then(|e| e.to_str()) == Some("gz") {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    let mut skipped = 0;
    for line in BufReader::new(reader).lines() {
        let line = line.map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<TelemetryRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!("Skipping malformed line in {}: {}", path.display(), e);
                skipped += 1;
            }
        }
    }
    Ok(skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openflow::TableStats;
    use crate::telemetry::record::{EventDetails, EventRecord, TableStatsRecord};
    use crate::telemetry::writer::{RotationPolicy, TelemetryWriter, WriterConfig};
    use tempfile::TempDir;

    fn writer(dir: &TempDir, rotation: RotationPolicy) -> TelemetryWriter {
        TelemetryWriter::new(WriterConfig {
            base_dir: dir.path().to_string_lossy().to_string(),
            rotation,
            immediate_flush: true,
            ..Default::default()
        })
        .unwrap()
    }

    fn table(dpid: u64, ts: u64) -> TelemetryRecord {
        TelemetryRecord::TableStats(TableStatsRecord::new(
            dpid,
            ts,
            &TableStats {
                table_id: 0,
                active_count: 2,
                lookup_count: ts,
                matched_count: 1,
            },
        ))
    }

    #[test]
    fn test_recent_is_newest_first() {
        let dir = TempDir::new().unwrap();
        let w = writer(&dir, RotationPolicy::Never);
        for ts in 1..=5 {
            w.write(&table(1, ts)).unwrap();
        }

        let query = TelemetryQuery::new(dir.path());
        let recent = query.recent(RecordKind::TableStats, 2).unwrap();
        let stamps: Vec<u64> = recent.iter().map(|r| r.ts_ms()).collect();
        assert_eq!(stamps, vec![5, 4]);
    }

    #[test]
    fn test_reads_across_compressed_rotations() {
        let dir = TempDir::new().unwrap();
        let w = writer(&dir, RotationPolicy::BySize(1));
        for ts in 1..=4 {
            w.write(&table(2, ts)).unwrap();
        }

        let query = TelemetryQuery::new(dir.path());
        assert_eq!(query.load(RecordKind::TableStats).unwrap().len(), 4);
    }

    #[test]
    fn test_filters_by_switch_and_event_type() {
        let dir = TempDir::new().unwrap();
        let w = writer(&dir, RotationPolicy::Never);
        w.write(&table(1, 10)).unwrap();
        w.write(&table(2, 11)).unwrap();
        w.write(&TelemetryRecord::Event(EventRecord::new(
            2,
            12,
            EventDetails::SwitchConnected,
        )))
        .unwrap();
        w.write(&TelemetryRecord::Event(EventRecord::new(
            2,
            13,
            EventDetails::SwitchDisconnected,
        )))
        .unwrap();

        let query = TelemetryQuery::new(dir.path());
        assert_eq!(query.by_switch(2, None, None).unwrap().len(), 3);
        assert_eq!(
            query
                .by_switch(2, Some(RecordKind::TableStats), None)
                .unwrap()
                .len(),
            1
        );

        let connects = query
            .events(Some(EventType::SwitchConnected), None)
            .unwrap();
        assert_eq!(connects.len(), 1);
        assert_eq!(connects[0].ts_ms(), 12);
    }

    #[test]
    fn test_statistics_skip_malformed_lines() {
        let dir = TempDir::new().unwrap();
        {
            let w = writer(&dir, RotationPolicy::Never);
            w.write(&table(1, 10)).unwrap();
            w.write(&table(3, 20)).unwrap();
        }
        let path = dir.path().join("table_stats.jsonl");
        let mut contents = std::fs::read_to_string(&path).unwrap();
        contents.push_str("{\"kind\":\"table_st\n");
        std::fs::write(&path, contents).unwrap();

        let stats = TelemetryQuery::new(dir.path()).statistics().unwrap();
        assert_eq!(stats.total_records(), 2);
        assert_eq!(stats.skipped_lines, 1);
        assert_eq!(stats.per_switch.get(&3), Some(&1));
        assert_eq!(stats.first_ts_ms, Some(10));
        assert_eq!(stats.last_ts_ms, Some(20));
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let dir = TempDir::new().unwrap();
        let query = TelemetryQuery::new(dir.path().join("absent"));
        assert!(query.statistics().is_err());
    }
}
