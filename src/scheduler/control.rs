//! Transfer control: per-entry stop requests
//!
//! Every running transfer is registered with a [`TransferHandle`]. The
//! controller records why it wants a transfer stopped and cancels the
//! handle's token; the worker checks the token at every chunk and disk
//! write and stops at the next boundary.

use crate::protocol::EntryId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Why a transfer was asked to stop.
///
/// When several requests race, the strongest one wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum StopIntent {
    None = 0,
    /// Engine shutdown; the entry stays resumable
    Shutdown = 1,
    /// User pause
    Pause = 2,
    /// The host interrupted background work
    Interrupt = 3,
    /// The entry is being deleted
    Remove = 4,
}

impl StopIntent {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Shutdown,
            2 => Self::Pause,
            3 => Self::Interrupt,
            4 => Self::Remove,
            _ => Self::None,
        }
    }
}

/// Stop flag of one running transfer
pub struct TransferHandle {
    intent: AtomicU8,
    token: CancellationToken,
    finished: watch::Sender<bool>,
}

impl TransferHandle {
    fn new() -> Self {
        let (finished, _) = watch::channel(false);
        Self {
            intent: AtomicU8::new(StopIntent::None as u8),
            token: CancellationToken::new(),
            finished,
        }
    }

    pub fn intent(&self) -> StopIntent {
        StopIntent::from_u8(self.intent.load(Ordering::Acquire))
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_stopping(&self) -> bool {
        self.token.is_cancelled()
    }

    fn request(&self, intent: StopIntent) {
        self.intent.fetch_max(intent as u8, Ordering::AcqRel);
        self.token.cancel();
    }

    /// Wait until the worker owning this handle has exited
    pub async fn wait_finished(&self) {
        let mut rx = self.finished.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }
}

/// Registry of running transfers
#[derive(Default)]
pub struct TransferControl {
    handles: RwLock<HashMap<EntryId, Arc<TransferHandle>>>,
}

impl TransferControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transfer about to start; returns its stop handle
    pub fn register(&self, id: &EntryId) -> Arc<TransferHandle> {
        let handle = Arc::new(TransferHandle::new());
        self.handles.write().insert(id.clone(), Arc::clone(&handle));
        handle
    }

    /// Unregister a transfer and wake everyone waiting on it
    pub fn finish(&self, id: &EntryId, handle: &Arc<TransferHandle>) {
        {
            let mut handles = self.handles.write();
            if handles.get(id).is_some_and(|h| Arc::ptr_eq(h, handle)) {
                handles.remove(id);
            }
        }
        handle.finished.send_replace(true);
    }

    /// Ask a transfer to stop; returns its handle if it is running
    pub fn request(&self, id: &EntryId, intent: StopIntent) -> Option<Arc<TransferHandle>> {
        let handle = self.handles.read().get(id).cloned()?;
        handle.request(intent);
        Some(handle)
    }

    /// Ask every running transfer to stop
    pub fn request_all(&self, intent: StopIntent) -> Vec<Arc<TransferHandle>> {
        let handles: Vec<Arc<TransferHandle>> = self.handles.read().values().cloned().collect();
        for handle in &handles {
            handle.request(intent);
        }
        handles
    }

    pub fn is_running(&self, id: &EntryId) -> bool {
        self.handles.read().contains_key(id)
    }

    pub fn running(&self) -> usize {
        self.handles.read().len()
    }
}
