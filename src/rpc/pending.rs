//! Pending invocation table.
//!
//! DESIGN
//! ======
//! Each in-flight call owns one slot: a `oneshot` sender keyed by its
//! correlation id. A response and the call's timeout race to REMOVE the id;
//! whoever removes it resolves the call, the loser finds nothing and does
//! nothing. Critical sections are plain insert/remove under a std mutex and
//! never span an await.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use frames::{Failure, Id, Response, RpcError};
use tokio::sync::oneshot;

use super::correlation::next_id;
use crate::error::ProtocolError;

/// Code of the synthetic response for a call that ran out of time.
pub const TIMEOUT_CODE: i64 = 11;
/// Code used when pending calls are failed by a disconnect.
pub const CONNECTION_CLOSED_CODE: i64 = 12;

#[derive(Debug, Default)]
pub struct PendingTable {
    slots: Mutex<HashMap<Id, oneshot::Sender<Response>>>,
}

impl PendingTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a slot under a fresh id. Colliding ids are regenerated.
    pub fn register(&self) -> Slot<'_> {
        let (tx, rx) = oneshot::channel();
        let mut slots = self.lock();
        let mut id = next_id();
        while slots.contains_key(&id) {
            id = next_id();
        }
        slots.insert(id.clone(), tx);
        Slot { table: self, id, rx }
    }

    /// Route a response to the call waiting on its id.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Unroutable`] for an error frame without an id and
    /// [`ProtocolError::UnknownId`] when nobody waits on the id (never sent,
    /// or already timed out).
    pub fn resolve(&self, response: Response) -> Result<(), ProtocolError> {
        let Some(id) = response.id() else {
            let message = response.error().map(|e| e.message.clone()).unwrap_or_default();
            return Err(ProtocolError::Unroutable(message));
        };
        let Some(tx) = self.lock().remove(id) else {
            return Err(ProtocolError::UnknownId(id.clone()));
        };
        // The receiver is gone only if the caller stopped waiting.
        let _ = tx.send(response);
        Ok(())
    }

    /// Remove the slot. `true` when this call removed it.
    pub fn claim(&self, id: &Id) -> bool {
        self.lock().remove(id).is_some()
    }

    /// Resolve every pending call with an error. Returns how many there were.
    pub fn fail_all(&self, code: i64, message: &str) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        let count = drained.len();
        for (id, tx) in drained {
            let _ = tx.send(failure(id, code, message));
        }
        count
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: &Id) -> bool {
        self.lock().contains_key(id)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Id, oneshot::Sender<Response>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One reserved slot. Dropping it releases the id.
#[derive(Debug)]
pub struct Slot<'a> {
    table: &'a PendingTable,
    id: Id,
    rx: oneshot::Receiver<Response>,
}

impl Slot<'_> {
    #[must_use]
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Wait for the response or the timeout, whichever claims the id first.
    pub async fn settle(mut self, timeout: Duration) -> Response {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => failure(self.id.clone(), CONNECTION_CLOSED_CODE, "connection closed"),
            Err(_) => {
                if self.table.claim(&self.id) {
                    return failure(self.id.clone(), TIMEOUT_CODE, "timeout");
                }
                // A response removed the id first; its send is already done.
                match (&mut self.rx).await {
                    Ok(response) => response,
                    Err(_) => failure(self.id.clone(), CONNECTION_CLOSED_CODE, "connection closed"),
                }
            }
        }
    }
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        self.table.claim(&self.id);
    }
}

fn failure(id: Id, code: i64, message: &str) -> Response {
    Response::Failure(Failure::new(Some(id), RpcError::new(code, message)))
}

#[cfg(test)]
#[path = "pending_test.rs"]
mod tests;
