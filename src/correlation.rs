//! Request/response correlation by message id.
//!
//! [`PendingTable`] records every outstanding request that expects a
//! correlated `RSP`. A requester registers an entry, writes its frame and
//! then waits on the returned [`PendingRequest`]. The connection reader is the
//! only party that consumes inbound bytes; it calls [`PendingTable::resolve`]
//! when a response arrives.
//!
//! Each entry is removed exactly once, by whichever of the reader, the
//! requester's timeout or session teardown gets there first. Entries carry a
//! registration token so a requester whose id was already answered and
//! reissued never removes its successor.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::sync::oneshot;
use tracing::debug;

use crate::{
    error::{BridgeError, Result},
    frame::{MessageId, Status},
};

/// Monotonic message id source.
///
/// Ids wrap at 65536 and never take the value zero.
#[derive(Debug)]
pub struct IdAllocator {
    last: AtomicU16,
}

impl Default for IdAllocator {
    fn default() -> Self { Self::starting_after(1) }
}

impl IdAllocator {
    /// Create an allocator whose first id follows `last`.
    #[must_use]
    pub fn starting_after(last: MessageId) -> Self {
        Self {
            last: AtomicU16::new(last),
        }
    }

    /// Return the next id in sequence.
    pub fn next(&self) -> MessageId {
        loop {
            let id = self.last.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }
}

/// How a pending request ended.
#[derive(Debug)]
enum Resolution {
    Answered(Status),
    Closed,
}

struct PendingEntry {
    token: u64,
    created_at: Instant,
    tx: oneshot::Sender<Resolution>,
}

/// Concurrent table of outstanding requests keyed by message id.
#[derive(Default)]
pub struct PendingTable {
    ids: IdAllocator,
    entries: DashMap<MessageId, PendingEntry>,
    tokens: AtomicU64,
    closed: AtomicBool,
}

impl std::fmt::Debug for PendingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTable")
            .field("pending", &self.entries.len())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl PendingTable {
    /// Create a table drawing ids from `ids`.
    #[must_use]
    pub fn new(ids: IdAllocator) -> Self {
        Self {
            ids,
            ..Self::default()
        }
    }

    /// Allocate an id that is not currently pending.
    ///
    /// Used for frames that expect no correlated reply.
    pub fn allocate_id(&self) -> MessageId {
        let mut id = self.ids.next();
        for _ in 0..u16::MAX {
            if !self.entries.contains_key(&id) {
                break;
            }
            id = self.ids.next();
        }
        id
    }

    /// Allocate a fresh id and register a pending request for it.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::SessionClosed`] once the table has been failed
    /// by teardown, or a transport error if every id is in flight.
    pub fn register(self: &Arc<Self>) -> Result<PendingRequest> {
        if self.is_closed() {
            return Err(BridgeError::SessionClosed);
        }
        for _ in 0..=u16::MAX {
            let id = self.ids.next();
            if let Entry::Vacant(slot) = self.entries.entry(id) {
                let (tx, rx) = oneshot::channel();
                let token = self.tokens.fetch_add(1, Ordering::Relaxed);
                let created_at = Instant::now();
                slot.insert(PendingEntry {
                    token,
                    created_at,
                    tx,
                });
                // Teardown may have drained the table between the check above
                // and the insert.
                if self.is_closed() {
                    self.remove_entry(id, token);
                    return Err(BridgeError::SessionClosed);
                }
                return Ok(PendingRequest {
                    id,
                    token,
                    created_at,
                    rx,
                    table: Arc::clone(self),
                });
            }
        }
        Err(BridgeError::Transport(std::io::Error::other(
            "no free message ids",
        )))
    }

    /// Deliver `status` to the request waiting on `id`.
    ///
    /// Returns `false` if no request with that id is pending.
    pub fn resolve(&self, id: MessageId, status: Status) -> bool {
        let Some((_, entry)) = self.entries.remove(&id) else {
            return false;
        };
        debug!(
            id,
            %status,
            elapsed_ms = entry.created_at.elapsed().as_millis(),
            "pending request resolved"
        );
        // The requester may have given up concurrently; nothing to deliver then.
        let _ = entry.tx.send(Resolution::Answered(status));
        true
    }

    /// Fail every pending request and refuse new registrations.
    pub fn fail_all(&self) {
        self.closed.store(true, Ordering::Release);
        let ids: Vec<MessageId> = self.entries.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.entries.remove(&id) {
                let _ = entry.tx.send(Resolution::Closed);
            }
        }
    }

    /// Whether teardown has failed the table.
    #[must_use]
    pub fn is_closed(&self) -> bool { self.closed.load(Ordering::Acquire) }

    /// Whether a request with `id` is outstanding.
    #[must_use]
    pub fn is_pending(&self, id: MessageId) -> bool { self.entries.contains_key(&id) }

    /// Number of outstanding requests.
    #[must_use]
    pub fn len(&self) -> usize { self.entries.len() }

    /// Whether no requests are outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    fn remove_entry(&self, id: MessageId, token: u64) -> bool {
        self.entries
            .remove_if(&id, |_, entry| entry.token == token)
            .is_some()
    }
}

/// Handle held by the requester of a correlated call.
///
/// Dropping the handle withdraws the request if it is still pending.
#[derive(Debug)]
pub struct PendingRequest {
    id: MessageId,
    token: u64,
    created_at: Instant,
    rx: oneshot::Receiver<Resolution>,
    table: Arc<PendingTable>,
}

impl PendingRequest {
    /// Id to stamp on the outbound frame.
    #[must_use]
    pub fn id(&self) -> MessageId { self.id }

    /// When the request was registered.
    #[must_use]
    pub fn created_at(&self) -> Instant { self.created_at }

    /// Wait up to `timeout` for the correlated response status.
    ///
    /// The status is returned as received; callers decide what a non-OK
    /// status means.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Timeout`] if no response arrives in time and
    /// [`BridgeError::SessionClosed`] if the session ends first.
    pub async fn wait(mut self, timeout: Duration) -> Result<Status> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(Resolution::Answered(status))) => Ok(status),
            Ok(Ok(Resolution::Closed) | Err(_)) => Err(BridgeError::SessionClosed),
            Err(_) => self.expire(timeout),
        }
    }

    /// Withdraw the request after its timer fired, keeping an answer that
    /// landed in between.
    fn expire(&mut self, timeout: Duration) -> Result<Status> {
        if !self.table.remove_entry(self.id, self.token) {
            // The reader resolved the entry as the timer fired.
            if let Ok(Resolution::Answered(status)) = self.rx.try_recv() {
                return Ok(status);
            }
        }
        #[cfg(feature = "metrics")]
        crate::metrics::inc_timeouts();
        Err(BridgeError::Timeout {
            id: self.id,
            after: timeout,
        })
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) { self.table.remove_entry(self.id, self.token); }
}
