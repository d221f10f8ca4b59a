//! RPC endpoint table.
//!
//! At most one handler per [`RpcId`]. Invocation is synchronous on the
//! calling thread and drives a fresh future; the table itself only maps ids
//! to handlers.

use std::collections::HashMap;
use std::sync::Arc;

use imc_common::{Envelope, Error, Payload, Result, RpcId};
use parking_lot::RwLock;

use crate::bus::Bus;

/// RPC handler. Runs on the calling thread; returns the response payload
/// (possibly an adopted external buffer) or the error the future fails with.
pub type RpcHandlerFn = Arc<dyn Fn(&Bus, RpcId, &Envelope) -> Result<Payload> + Send + Sync>;

#[derive(Default)]
pub(crate) struct RpcTable {
    entries: RwLock<HashMap<RpcId, RpcHandlerFn>>,
}

impl RpcTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a handler; a live registration under the same id is refused.
    pub fn register(&self, id: RpcId, handler: RpcHandlerFn) -> Result<()> {
        let mut entries = self.entries.write();
        if entries.contains_key(&id) {
            return Err(Error::RpcAlreadyRegistered);
        }
        entries.insert(id, handler);
        Ok(())
    }

    /// Removes a handler.
    pub fn unregister(&self, id: RpcId) -> Result<()> {
        if self.entries.write().remove(&id).is_none() {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    /// The handler of `id`, if registered.
    pub fn get(&self, id: RpcId) -> Option<RpcHandlerFn> {
        self.entries.read().get(&id).cloned()
    }

    /// Number of registered endpoints.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Drops all registrations. Shutdown path.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl std::fmt::Debug for RpcTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcTable").field("len", &self.len()).finish()
    }
}
