use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;

use crate::directory::KeyDirectory;
use crate::transport::{Request, Transport, TransportFailure};

/// A failure to inject into a future request.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// Fail without the directory seeing the request.
    Reject(TransportFailure),
    /// Apply the request to the directory, then report the response as lost.
    LoseResponse,
}

/// In-process [`Transport`] that hands requests straight to a [`KeyDirectory`].
pub struct LoopbackTransport {
    directory: Arc<KeyDirectory>,
    open: watch::Sender<bool>,
    faults: Mutex<VecDeque<Fault>>,
    submitted: AtomicUsize,
}

impl LoopbackTransport {
    pub fn new(directory: Arc<KeyDirectory>) -> Self {
        let (open, _) = watch::channel(true);
        Self {
            directory,
            open,
            faults: Mutex::new(VecDeque::new()),
            submitted: AtomicUsize::new(0),
        }
    }

    pub fn directory(&self) -> &Arc<KeyDirectory> {
        &self.directory
    }

    /// Hold every request that arrives from now on until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.open.send_replace(false);
    }

    pub fn resume(&self) {
        self.open.send_replace(true);
    }

    /// Queue `fault` for the next request that reaches the directory.
    pub fn fail_next(&self, fault: Fault) {
        self.faults.lock().push_back(fault);
    }

    /// Requests received so far, including those still held by [`pause`](Self::pause).
    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn submit(&self, request: Request) -> Result<Value, TransportFailure> {
        self.submitted.fetch_add(1, Ordering::SeqCst);

        let mut open = self.open.subscribe();
        if open.wait_for(|open| *open).await.is_err() {
            return Err(TransportFailure::Network("loopback closed".into()));
        }

        let fault = self.faults.lock().pop_front();
        match fault {
            Some(Fault::Reject(failure)) => {
                tracing::debug!(endpoint = %request.endpoint, "injected rejection");
                Err(failure)
            }
            Some(Fault::LoseResponse) => {
                let applied = self.directory.handle(&request).is_ok();
                tracing::debug!(endpoint = %request.endpoint, applied, "injected lost response");
                Err(TransportFailure::Network("connection reset before response".into()))
            }
            None => self.directory.handle(&request).map_err(|e| e.into_failure()),
        }
    }
}
