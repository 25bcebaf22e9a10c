use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::watchable_store::WatchableInner;
use super::CancelFn;
use super::FilterFn;
use super::WatchId;
use super::WatchResponse;
use super::WatcherHandle;
use super::AUTO_WATCH_ID;
use crate::metrics::WATCH_STREAM_GAUGE;
use crate::Result;
use crate::WatchError;

struct StreamState {
    next_id: WatchId,
    closed: bool,
    cancels: HashMap<WatchId, CancelFn>,
    handles: HashMap<WatchId, WatcherHandle>,
    tx: Option<mpsc::Sender<WatchResponse>>,
}

/// A set of watchers sharing one response channel.
///
/// Responses of every watcher created on the stream arrive on the receiver
/// returned by [`WatchStream::chan`], tagged with their watch id.
pub struct WatchStream {
    watchable: Arc<WatchableInner>,
    rx: Mutex<Option<mpsc::Receiver<WatchResponse>>>,
    state: Mutex<StreamState>,
}

impl std::fmt::Debug for WatchStream {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("WatchStream")
            .field("next_id", &state.next_id)
            .field("watchers", &state.handles.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl WatchStream {
    pub(crate) fn new(
        watchable: Arc<WatchableInner>,
        chan_buf_len: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(chan_buf_len);
        Self {
            watchable,
            rx: Mutex::new(Some(rx)),
            state: Mutex::new(StreamState {
                next_id: 0,
                closed: false,
                cancels: HashMap::new(),
                handles: HashMap::new(),
                tx: Some(tx),
            }),
        }
    }

    /// Creates a watcher on `[key, end)` starting at `start_rev`.
    ///
    /// `end == None` watches `key` alone and an empty `end` watches every key
    /// from `key` on. Pass [`AUTO_WATCH_ID`] to have the stream pick an id.
    pub fn watch(
        &self,
        id: WatchId,
        key: &[u8],
        end: Option<&[u8]>,
        start_rev: i64,
        filters: Vec<FilterFn>,
    ) -> Result<WatchId> {
        if let Some(end) = end {
            if !end.is_empty() && key >= end {
                return Err(WatchError::EmptyWatcherRange.into());
            }
        }

        let mut state = self.state.lock();
        if state.closed {
            return Err(WatchError::StreamClosed.into());
        }
        let Some(tx) = state.tx.clone() else {
            return Err(WatchError::StreamClosed.into());
        };

        let id = if id == AUTO_WATCH_ID {
            while state.cancels.contains_key(&state.next_id) {
                state.next_id += 1;
            }
            let id = state.next_id;
            state.next_id += 1;
            id
        } else {
            if state.cancels.contains_key(&id) {
                return Err(WatchError::WatcherDuplicateId.into());
            }
            id
        };

        let (handle, cancel) = self.watchable.watch(
            key.to_vec(),
            end.map(<[u8]>::to_vec),
            start_rev,
            id,
            tx,
            filters,
        );
        state.cancels.insert(id, cancel);
        state.handles.insert(id, handle);
        debug!("watch {} created at start revision {}", id, start_rev);
        Ok(id)
    }

    /// Takes the response receiver. Returns `None` once taken.
    pub fn chan(&self) -> Option<mpsc::Receiver<WatchResponse>> {
        self.rx.lock().take()
    }

    /// Cancels watcher `id` and queues a final `canceled` response for it.
    /// The response is retried until the channel has room or is closed.
    pub fn cancel(
        &self,
        id: WatchId,
    ) -> Result<()> {
        let (cancel, tx) = {
            let mut state = self.state.lock();
            let Some(cancel) = state.cancels.remove(&id) else {
                return Err(WatchError::WatcherNotExist.into());
            };
            state.handles.remove(&id);
            (cancel, state.tx.clone())
        };

        // may block while the scheduler is delivering to this watcher
        cancel();

        if let Some(tx) = tx {
            let wr = WatchResponse {
                watch_id: id,
                revision: self.rev(),
                canceled: true,
                ..Default::default()
            };
            self.watchable.send_canceled(tx, wr);
        }
        Ok(())
    }

    /// Cancels every watcher and closes the response channel once the
    /// pending responses are drained.
    pub fn close(&self) {
        let cancels = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.tx = None;
            state.handles.clear();
            std::mem::take(&mut state.cancels)
        };
        for (_, cancel) in cancels {
            cancel();
        }
        WATCH_STREAM_GAUGE.dec();
    }

    /// Current revision of the underlying store
    pub fn rev(&self) -> i64 {
        self.watchable.store.rev()
    }

    /// Asks for a progress response on watcher `id`. Only synced watchers
    /// answer; the others will report progress with their next events.
    pub fn request_progress(
        &self,
        id: WatchId,
    ) {
        let handle = self.state.lock().handles.get(&id).copied();
        if let Some(handle) = handle {
            self.watchable.progress(handle);
        }
    }
}

impl Drop for WatchStream {
    fn drop(&mut self) {
        self.close();
    }
}
