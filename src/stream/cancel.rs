use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, watch};

// ============================================================================
// CANCELLATION TOKEN
// ============================================================================

#[derive(Clone, Debug)]
pub struct CancellationToken {
    cancelled: Arc<watch::Sender<bool>>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        let (cancelled, _) = watch::channel(false);
        Self {
            cancelled: Arc::new(cancelled),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Resolves once `cancel` has been called, immediately if it already was.
    pub async fn cancelled(&self) {
        let mut rx = self.cancelled.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

// ============================================================================
// REQUEST MANAGER
// ============================================================================

/// Cancellation handles for generations that are still producing.
#[derive(Default)]
pub struct RequestManager {
    active_requests: RwLock<HashMap<String, CancellationToken>>,
}

impl RequestManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, request_id: String, token: CancellationToken) {
        let mut requests = self.active_requests.write().await;
        requests.insert(request_id, token);
    }

    pub async fn cancel(&self, request_id: &str) -> bool {
        let requests = self.active_requests.read().await;
        if let Some(token) = requests.get(request_id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    pub async fn unregister(&self, request_id: &str) {
        let mut requests = self.active_requests.write().await;
        requests.remove(request_id);
    }

    pub async fn active_count(&self) -> usize {
        self.active_requests.read().await.len()
    }
}
