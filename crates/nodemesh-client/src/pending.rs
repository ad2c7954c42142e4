//! Pending-request table
//!
//! Maps the id of every sent request to the future waiting for its RESPONSE.
//! Each entry is resolved at most once: a response, a timeout and a
//! disconnect all race on removing the entry, and only the winner completes
//! the future.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use nodemesh_common::protocol::error::{ClusterError, Result};
use nodemesh_common::{Envelope, MessageId};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::warn;

type Completion = oneshot::Sender<Result<Envelope>>;

/// Requests awaiting a correlated RESPONSE.
#[derive(Debug, Default)]
pub struct PendingRequests {
    entries: DashMap<MessageId, Completion>,
    closed: AtomicBool,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks a request and returns the future of its response.
    ///
    /// Fails with [`ClusterError::Disconnected`] once the table is closed, and
    /// with [`ClusterError::DuplicateRequest`] while a request with the same
    /// id is still waiting.
    pub fn register(&self, message_id: &str) -> Result<PendingResponse> {
        if self.is_closed() {
            return Err(ClusterError::Disconnected);
        }

        let (tx, rx) = oneshot::channel();
        match self.entries.entry(message_id.to_string()) {
            Entry::Occupied(_) => {
                return Err(ClusterError::DuplicateRequest(message_id.to_string()));
            }
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }

        // A concurrent fail_all may have drained the table before our insert
        if self.is_closed() {
            self.entries.remove(message_id);
            return Err(ClusterError::Disconnected);
        }

        Ok(PendingResponse {
            message_id: message_id.to_string(),
            rx,
        })
    }

    /// Resolves the request `response` answers.
    ///
    /// An error-flagged response fails the request with its content. Returns
    /// `false` when no request is waiting for it.
    pub fn complete(&self, response: Envelope) -> bool {
        let Some(request_id) = response.correlation_id().map(str::to_string) else {
            return false;
        };

        let Some((_, completion)) = self.entries.remove(&request_id) else {
            warn!("Received response for unknown request: {}", request_id);
            return false;
        };

        let result = if response.is_error() {
            Err(ClusterError::Remote(response.content.unwrap_or_default()))
        } else {
            Ok(response)
        };
        let _ = completion.send(result);
        true
    }

    /// Fails one request. Returns `false` if it was already resolved.
    pub fn fail(&self, message_id: &str, error: ClusterError) -> bool {
        match self.entries.remove(message_id) {
            Some((_, completion)) => {
                let _ = completion.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Forgets a request without completing it.
    pub fn remove(&self, message_id: &str) -> bool {
        self.entries.remove(message_id).is_some()
    }

    /// Closes the table and fails every outstanding request.
    ///
    /// Returns the number of requests failed.
    pub fn fail_all<F>(&self, error: F) -> usize
    where
        F: Fn() -> ClusterError,
    {
        self.closed.store(true, Ordering::SeqCst);

        let ids: Vec<MessageId> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        ids.iter().filter(|id| self.fail(id, error())).count()
    }

    /// Accepts new requests again after [`fail_all`](Self::fail_all).
    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Future of a request's RESPONSE.
///
/// Resolves to the response envelope, to [`ClusterError::Remote`] for an
/// error-flagged response, or to [`ClusterError::Disconnected`] if the
/// connection goes away first.
#[derive(Debug)]
pub struct PendingResponse {
    message_id: MessageId,
    rx: oneshot::Receiver<Result<Envelope>>,
}

impl PendingResponse {
    /// Id of the request this future belongs to.
    pub fn message_id(&self) -> &str {
        &self.message_id
    }
}

impl Future for PendingResponse {
    type Output = Result<Envelope>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(ClusterError::Disconnected)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodemesh_common::MessageType;

    fn request() -> Envelope {
        Envelope::with_content(MessageType::Data, "ping").with_source("client-1")
    }

    #[tokio::test]
    async fn test_response_resolves_matching_request() {
        let pending = PendingRequests::new();
        let req = request();
        let future = pending.register(req.message_id()).unwrap();
        assert_eq!(future.message_id(), req.message_id());
        assert_eq!(pending.len(), 1);

        let response = Envelope::response_to(&req, "Data received");
        assert!(pending.complete(response.clone()));

        let resolved = future.await.unwrap();
        assert_eq!(resolved.message_id(), response.message_id());
        assert_eq!(resolved.content.as_deref(), Some("Data received"));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_error_response_fails_request() {
        let pending = PendingRequests::new();
        let req = request();
        let future = pending.register(req.message_id()).unwrap();

        pending.complete(Envelope::error_response_to(&req, "Unknown message type"));

        match future.await {
            Err(ClusterError::Remote(detail)) => assert_eq!(detail, "Error: Unknown message type"),
            other => panic!("expected remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_response_resolves_only_its_own_request() {
        let pending = PendingRequests::new();
        let first = request();
        let second = request();
        let first_future = pending.register(first.message_id()).unwrap();
        let _second_future = pending.register(second.message_id()).unwrap();

        pending.complete(Envelope::response_to(&first, "one"));

        assert_eq!(first_future.await.unwrap().content.as_deref(), Some("one"));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_unmatched_response_is_dropped() {
        let pending = PendingRequests::new();

        assert!(!pending.complete(Envelope::response_to(&request(), "late")));
        // No correlation id at all
        assert!(!pending.complete(Envelope::with_content(MessageType::Response, "Welcome")));
    }

    #[test]
    fn test_second_completion_is_ignored() {
        let pending = PendingRequests::new();
        let req = request();
        let _future = pending.register(req.message_id()).unwrap();

        assert!(pending.complete(Envelope::response_to(&req, "first")));
        assert!(!pending.complete(Envelope::response_to(&req, "duplicate")));
    }

    #[tokio::test]
    async fn test_fail_all_fails_every_request() {
        let pending = PendingRequests::new();
        let futures: Vec<_> = (0..5)
            .map(|_| pending.register(request().message_id()).unwrap())
            .collect();

        assert_eq!(pending.fail_all(|| ClusterError::Disconnected), 5);
        assert!(pending.is_empty());

        for result in futures::future::join_all(futures).await {
            assert!(matches!(result, Err(ClusterError::Disconnected)));
        }
    }

    #[tokio::test]
    async fn test_response_after_fail_all_is_dropped() {
        let pending = PendingRequests::new();
        let req = request();
        let future = pending.register(req.message_id()).unwrap();

        pending.fail_all(|| ClusterError::Disconnected);
        assert!(!pending.complete(Envelope::response_to(&req, "too late")));

        assert!(matches!(future.await, Err(ClusterError::Disconnected)));
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected_and_first_request_kept() {
        let pending = PendingRequests::new();
        let req = request();
        let first = pending.register(req.message_id()).unwrap();

        assert!(matches!(
            pending.register(req.message_id()),
            Err(ClusterError::DuplicateRequest(id)) if id == req.message_id()
        ));
        assert_eq!(pending.len(), 1);

        pending.complete(Envelope::response_to(&req, "still answered"));
        assert_eq!(first.await.unwrap().content.as_deref(), Some("still answered"));

        // The id is free again once resolved
        assert!(pending.register(req.message_id()).is_ok());
    }

    #[test]
    fn test_closed_table_rejects_and_reopens() {
        let pending = PendingRequests::new();
        pending.fail_all(|| ClusterError::Disconnected);

        assert!(pending.is_closed());
        assert!(matches!(pending.register("msg-1"), Err(ClusterError::Disconnected)));

        pending.reopen();
        assert!(pending.register("msg-1").is_ok());
    }

    #[tokio::test]
    async fn test_removed_request_resolves_as_disconnected() {
        let pending = PendingRequests::new();
        let future = pending.register("msg-1").unwrap();

        assert!(pending.remove("msg-1"));
        assert!(!pending.remove("msg-1"));
        assert!(matches!(future.await, Err(ClusterError::Disconnected)));
    }

    #[tokio::test]
    async fn test_fail_single_request() {
        let pending = PendingRequests::new();
        let future = pending.register("msg-1").unwrap();

        assert!(pending.fail("msg-1", ClusterError::Timeout(50)));
        assert!(matches!(future.await, Err(ClusterError::Timeout(50))));
    }
}
