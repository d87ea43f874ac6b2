//! Request table matching outbound calls to exactly one resolution.
//!
//! Each dispatched request gets an entry keyed by [`RequestId`]. The entry is
//! removed under the table lock before its result is sent, so a request can
//! be resolved at most once no matter how many paths race to finish it
//! (transport completion, timeout, explicit cancel, shutdown). Shutdown
//! drains the table and resolves every remaining entry as cancelled.
//! Dropping a [`PendingRequest`] abandons it: its entry is removed and its
//! transport task aborted, so the table never outlives its waiters.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::error::KeysError;
use crate::transport::{Request, Transport, TransportFailure};

/// Outcome delivered to whoever awaits a request.
pub type Resolution = Result<Value, KeysError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

struct Entry {
    endpoint: String,
    tx: oneshot::Sender<Resolution>,
    task: Option<AbortHandle>,
}

#[derive(Default)]
struct Table {
    entries: HashMap<RequestId, Entry>,
    closed: bool,
}

/// Shared request table. Clones refer to the same table.
#[derive(Clone)]
pub struct RequestLedger {
    table: Arc<Mutex<Table>>,
    next_id: Arc<AtomicU64>,
    timeout: Option<Duration>,
}

impl RequestLedger {
    /// `timeout` bounds how long a dispatched request may stay in flight.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            table: Arc::new(Mutex::new(Table::default())),
            next_id: Arc::new(AtomicU64::new(1)),
            timeout,
        }
    }

    /// Add an entry and return the future its resolution will be delivered to.
    ///
    /// After [`shutdown`](Self::shutdown) the returned future is already cancelled.
    pub fn register(&self, endpoint: &str) -> PendingRequest {
        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();

        let mut table = self.table.lock();
        if table.closed {
            drop(table);
            let _ = tx.send(Err(KeysError::Cancelled));
        } else {
            table.entries.insert(
                id,
                Entry {
                    endpoint: endpoint.to_owned(),
                    tx,
                    task: None,
                },
            );
        }

        PendingRequest {
            id,
            rx,
            table: Arc::downgrade(&self.table),
        }
    }

    /// Deliver `resolution` to the request's waiter.
    ///
    /// Returns `false` if the request was already resolved (or never existed).
    pub fn resolve(&self, id: RequestId, resolution: Resolution) -> bool {
        let Some(entry) = self.table.lock().entries.remove(&id) else {
            return false;
        };

        match &resolution {
            Ok(_) => tracing::debug!(request_id = %id, endpoint = %entry.endpoint, "request resolved"),
            Err(e) => tracing::debug!(request_id = %id, endpoint = %entry.endpoint, error = %e, "request failed"),
        }
        // The waiter may have stopped listening; the request still counts as resolved.
        let _ = entry.tx.send(resolution);
        true
    }

    /// Register `request` and submit it on a background task.
    pub fn dispatch(&self, transport: Arc<dyn Transport>, request: Request) -> PendingRequest {
        let pending = self.register(&request.endpoint);
        let id = pending.id;
        if !self.is_pending(id) {
            return pending;
        }

        let ledger = self.clone();
        let timeout = self.timeout;
        let task = tokio::spawn(async move {
            let outcome = match timeout {
                Some(limit) => tokio::time::timeout(limit, transport.submit(request))
                    .await
                    .unwrap_or_else(|_| {
                        Err(TransportFailure::Network(format!(
                            "timed out after {}ms",
                            limit.as_millis()
                        )))
                    }),
                None => transport.submit(request).await,
            };
            if !ledger.resolve(id, outcome.map_err(TransportFailure::classify)) {
                tracing::debug!(request_id = %id, "late completion ignored");
            }
        });

        if let Some(entry) = self.table.lock().entries.get_mut(&id) {
            entry.task = Some(task.abort_handle());
        }
        pending
    }

    /// Stop waiting for one request. Server-side effects already applied are kept.
    pub fn cancel(&self, id: RequestId) -> bool {
        let task = self
            .table
            .lock()
            .entries
            .get_mut(&id)
            .and_then(|entry| entry.task.take());
        let resolved = self.resolve(id, Err(KeysError::Cancelled));
        if let Some(task) = task {
            task.abort();
        }
        resolved
    }

    /// Resolve every pending request as cancelled and refuse new ones.
    ///
    /// Returns how many requests were cancelled.
    pub fn shutdown(&self) -> usize {
        let drained: Vec<(RequestId, Entry)> = {
            let mut table = self.table.lock();
            table.closed = true;
            table.entries.drain().collect()
        };

        let count = drained.len();
        for (id, entry) in drained {
            tracing::debug!(request_id = %id, endpoint = %entry.endpoint, "cancelling on shutdown");
            let _ = entry.tx.send(Err(KeysError::Cancelled));
            if let Some(task) = entry.task {
                task.abort();
            }
        }
        if count > 0 {
            tracing::info!(cancelled = count, "request ledger shut down");
        }
        count
    }

    pub fn is_pending(&self, id: RequestId) -> bool {
        self.table.lock().entries.contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.table.lock().entries.len()
    }

    pub fn is_closed(&self) -> bool {
        self.table.lock().closed
    }
}

/// Future resolving to a request's single outcome.
#[derive(Debug)]
pub struct PendingRequest {
    id: RequestId,
    rx: oneshot::Receiver<Resolution>,
    table: Weak<Mutex<Table>>,
}

impl PendingRequest {
    pub fn id(&self) -> RequestId {
        self.id
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let abandoned = table.lock().entries.remove(&self.id);
        if let Some(entry) = abandoned {
            tracing::debug!(request_id = %self.id, endpoint = %entry.endpoint, "request abandoned");
            if let Some(task) = entry.task {
                task.abort();
            }
        }
    }
}

impl Future for PendingRequest {
    type Output = Resolution;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the table itself went away: report it as cancelled.
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(KeysError::Cancelled)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;

    /// Never answers.
    struct Silent;

    #[async_trait]
    impl Transport for Silent {
        async fn submit(&self, _request: Request) -> Result<Value, TransportFailure> {
            std::future::pending().await
        }
    }

    /// Echoes the body back.
    struct Echo(AtomicUsize);

    #[async_trait]
    impl Transport for Echo {
        async fn submit(&self, request: Request) -> Result<Value, TransportFailure> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(request.body)
        }
    }

    #[tokio::test]
    async fn resolves_exactly_once() {
        let ledger = RequestLedger::new(None);
        let pending = ledger.register("/keys/upload");
        let id = pending.id();

        assert!(ledger.resolve(id, Ok(json!({"n": 1}))));
        assert!(!ledger.resolve(id, Ok(json!({"n": 2}))));
        assert!(!ledger.cancel(id));

        assert_eq!(pending.await.unwrap(), json!({"n": 1}));
        assert_eq!(ledger.pending_count(), 0);
    }

    #[tokio::test]
    async fn dispatch_delivers_transport_result() {
        let ledger = RequestLedger::new(None);
        let transport = Arc::new(Echo(AtomicUsize::new(0)));
        let body = json!({"device_keys": {}});

        let result = ledger
            .dispatch(transport.clone(), Request::post("/keys/query", body.clone()))
            .await
            .unwrap();

        assert_eq!(result, body);
        assert_eq!(transport.0.load(Ordering::SeqCst), 1);
        assert_eq!(ledger.pending_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_cancels_every_pending_request() {
        let ledger = RequestLedger::new(None);
        let transport: Arc<dyn Transport> = Arc::new(Silent);
        let pending: Vec<PendingRequest> = (0..5)
            .map(|_| ledger.dispatch(transport.clone(), Request::post("/keys/upload", json!({}))))
            .collect();
        assert_eq!(ledger.pending_count(), 5);

        assert_eq!(ledger.shutdown(), 5);
        assert_eq!(ledger.pending_count(), 0);
        for request in pending {
            assert_eq!(request.await, Err(KeysError::Cancelled));
        }

        // Nothing is left to cancel a second time.
        assert_eq!(ledger.shutdown(), 0);
    }

    #[tokio::test]
    async fn requests_after_shutdown_are_cancelled_immediately() {
        let ledger = RequestLedger::new(None);
        ledger.shutdown();
        assert!(ledger.is_closed());

        let transport = Arc::new(Echo(AtomicUsize::new(0)));
        let result = ledger
            .dispatch(transport.clone(), Request::post("/keys/query", json!({})))
            .await;
        assert_eq!(result, Err(KeysError::Cancelled));
        assert_eq!(transport.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_resolves_single_request() {
        let ledger = RequestLedger::new(None);
        let transport: Arc<dyn Transport> = Arc::new(Silent);
        let first = ledger.dispatch(transport.clone(), Request::post("/keys/query", json!({})));
        let second = ledger.dispatch(transport, Request::post("/keys/query", json!({})));

        assert!(ledger.cancel(first.id()));
        assert_eq!(first.await, Err(KeysError::Cancelled));
        assert!(ledger.is_pending(second.id()));
        assert_eq!(ledger.pending_count(), 1);
    }

    #[tokio::test]
    async fn dropped_waiter_removes_its_entry() {
        let ledger = RequestLedger::new(None);
        let transport: Arc<dyn Transport> = Arc::new(Silent);
        let kept = ledger.dispatch(transport.clone(), Request::post("/keys/query", json!({})));
        let dropped = ledger.dispatch(transport, Request::post("/keys/query", json!({})));
        let dropped_id = dropped.id();
        assert_eq!(ledger.pending_count(), 2);

        drop(dropped);
        assert!(!ledger.is_pending(dropped_id));
        assert!(ledger.is_pending(kept.id()));
        assert_eq!(ledger.pending_count(), 1);
        assert!(!ledger.resolve(dropped_id, Ok(json!({}))));
    }

    #[tokio::test]
    async fn timeout_resolves_as_transport_error() {
        let ledger = RequestLedger::new(Some(Duration::from_millis(20)));
        let result = ledger
            .dispatch(Arc::new(Silent), Request::post("/keys/upload", json!({})))
            .await;
        assert!(matches!(result, Err(KeysError::TransportError { status: 0, .. })));
    }

    #[tokio::test]
    async fn concurrent_resolution_delivers_once() {
        let ledger = RequestLedger::new(None);
        let pending = ledger.register("/keys/upload");
        let id = pending.id();

        let wins = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for n in 0..16 {
            let ledger = ledger.clone();
            let wins = wins.clone();
            handles.push(tokio::spawn(async move {
                if ledger.resolve(id, Ok(json!(n))) {
                    wins.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(wins.load(Ordering::SeqCst), 1);
        assert!(pending.await.is_ok());
    }
}
