//! Datapath registry: the set of switches connected right now.
//!
//! Shared by the controller (register/unregister on connect/disconnect) and
//! the telemetry poller (snapshot every tick).
//!
//! A datapath is CONNECTED exactly while it has an entry; removal is the
//! transition to DISCONNECTED, so no disconnected entry is ever observable.
//!
//! # Reconnects
//!
//! Every registration carries the `ConnectionId` of the transport connection
//! that produced it. A switch may reconnect under the same datapath id before
//! the old connection has noticed it is dead; the old connection's late
//! disconnect then names a connection that is no longer current and leaves the
//! new registration alone.
//!
//! # Thread Safety
//! - Membership sits behind a single `RwLock`; every operation holds it only
//!   for a map operation, never across a send to a switch
//! - `snapshot()` copies the entries out under the read lock, so callers
//!   iterate a point-in-time view that later changes cannot touch

use crate::command::SwitchHandle;
use crate::types::{now_ms, ConnectionId, DatapathId};
use log::debug;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A connected switch.
#[derive(Clone)]
pub struct Datapath {
    pub id: DatapathId,
    /// Transport connection this registration belongs to
    pub connection: ConnectionId,
    pub handle: Arc<dyn SwitchHandle>,
    /// Registration time (Unix ms)
    pub connected_at: u64,
}

impl fmt::Debug for Datapath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Datapath")
            .field("id", &self.id)
            .field("connection", &self.connection)
            .field("connected_at", &self.connected_at)
            .finish()
    }
}

#[derive(Default)]
pub struct DatapathRegistry {
    datapaths: RwLock<HashMap<DatapathId, Datapath>>,
}

impl DatapathRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `id` under a fresh connection and returns that connection.
    pub fn register(&self, id: DatapathId, handle: Arc<dyn SwitchHandle>) -> ConnectionId {
        let connection = ConnectionId::next();
        self.register_connection(id, connection, handle);
        connection
    }

    /// Inserts or overwrites the entry for `id`. The newest connection wins.
    pub fn register_connection(
        &self,
        id: DatapathId,
        connection: ConnectionId,
        handle: Arc<dyn SwitchHandle>,
    ) {
        let datapath = Datapath {
            id,
            connection,
            handle,
            connected_at: now_ms(),
        };
        if let Some(previous) = self.datapaths.write().insert(id, datapath) {
            debug!(
                "Switch {} re-registered: {} replaces {}",
                id, connection, previous.connection
            );
        }
    }

    /// Removes the entry for `id` if it still belongs to `connection`.
    ///
    /// Absent ids and superseded connections are a no-op; returns whether an
    /// entry was removed.
    pub fn unregister(&self, id: DatapathId, connection: ConnectionId) -> bool {
        let mut datapaths = self.datapaths.write();
        match datapaths.get(&id) {
            Some(current) if current.connection == connection => {
                datapaths.remove(&id);
                true
            }
            _ => false,
        }
    }

    /// Point-in-time copy of the membership, ordered by datapath id.
    pub fn snapshot(&self) -> Vec<Datapath> {
        let mut datapaths: Vec<Datapath> = self.datapaths.read().values().cloned().collect();
        datapaths.sort_by_key(|dp| dp.id);
        datapaths
    }

    /// Handle for a connected datapath.
    pub fn handle(&self, id: DatapathId) -> Option<Arc<dyn SwitchHandle>> {
        self.datapaths
            .read()
            .get(&id)
            .map(|dp| Arc::clone(&dp.handle))
    }

    /// Connection currently registered for `id`.
    pub fn connection(&self, id: DatapathId) -> Option<ConnectionId> {
        self.datapaths.read().get(&id).map(|dp| dp.connection)
    }

    pub fn is_connected(&self, id: DatapathId) -> bool {
        self.datapaths.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.datapaths.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.datapaths.read().is_empty()
    }
}
