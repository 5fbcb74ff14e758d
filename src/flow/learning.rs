//! Per-datapath MAC learning tables.
//!
//! # Thread Safety
//! - The outer map is read-locked only long enough to fetch one datapath's
//!   table, so datapaths never block each other
//! - Each table has its own mutex; packets from the same datapath serialize
//!   their learn-then-lookup step on it
//!
//! Entries never age out and tables are unbounded. A table is reset when its
//! datapath reconnects and otherwise lingers after disconnect.

use crate::types::{DatapathId, MacAddr, PortNo};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Address → ingress port for one datapath. Last write wins.
#[derive(Debug, Default, Clone)]
pub struct MacTable {
    entries: HashMap<MacAddr, PortNo>,
}

impl MacTable {
    /// Records `addr` on `port`; returns the previous port if it moved.
    pub fn learn(&mut self, addr: MacAddr, port: PortNo) -> Option<PortNo> {
        self.entries.insert(addr, port).filter(|prev| *prev != port)
    }

    pub fn lookup(&self, addr: &MacAddr) -> Option<PortNo> {
        self.entries.get(addr).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> HashMap<MacAddr, PortNo> {
        self.entries.clone()
    }
}

/// Outcome of one learn-then-lookup step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Learned {
    /// Port the destination was learned on, if known.
    pub dst_port: Option<PortNo>,
    /// Previous port of the source when it moved.
    pub moved_from: Option<PortNo>,
}

#[derive(Default)]
pub struct MacLearning {
    tables: RwLock<HashMap<DatapathId, Arc<Mutex<MacTable>>>>,
}

impl MacLearning {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table for `id`, created on first use.
    fn table(&self, id: DatapathId) -> Arc<Mutex<MacTable>> {
        if let Some(table) = self.tables.read().get(&id) {
            return Arc::clone(table);
        }
        let mut tables = self.tables.write();
        Arc::clone(tables.entry(id).or_default())
    }

    /// Learns `src → in_port` and looks up `dst` under one lock hold.
    pub fn learn_and_lookup(
        &self,
        id: DatapathId,
        src: MacAddr,
        in_port: PortNo,
        dst: MacAddr,
    ) -> Learned {
        let table = self.table(id);
        let mut guard = table.lock();
        let moved_from = guard.learn(src, in_port);
        Learned {
            dst_port: guard.lookup(&dst),
            moved_from,
        }
    }

    /// Clears the table for a (re)connected datapath.
    pub fn reset(&self, id: DatapathId) {
        if let Some(table) = self.tables.read().get(&id) {
            *table.lock() = MacTable::default();
        }
    }

    /// Copy of the current table contents, empty if never seen.
    pub fn entries(&self, id: DatapathId) -> HashMap<MacAddr, PortNo> {
        self.tables
            .read()
            .get(&id)
            .map(|table| table.lock().entries())
            .unwrap_or_default()
    }

    /// Number of datapaths with a table, live or stale.
    pub fn datapath_count(&self) -> usize {
        self.tables.read().len()
    }
}
