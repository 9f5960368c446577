use std::collections::VecDeque;

use data_model::{requests::Request, RequestId};
use serde::Serialize;
use thopter_utils::RingBuffer;
use tracing::warn;

/// Requests of one kind, grouped by status. Pending requests are kept in
/// creation order; terminal ones are kept in bounded history buffers.
#[derive(Debug)]
pub struct RequestLog<R: Request> {
    pending: VecDeque<R>,
    processing: Vec<R>,
    completed: RingBuffer<R>,
    failed: RingBuffer<R>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestLogSnapshot<R> {
    pub pending: Vec<R>,
    pub processing: Vec<R>,
    pub completed: Vec<R>,
    pub failed: Vec<R>,
}

impl<R: Request> RequestLog<R> {
    pub fn new(history: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            processing: Vec::new(),
            completed: RingBuffer::new(history),
            failed: RingBuffer::new(history),
        }
    }

    pub fn enqueue(&mut self, request: R) {
        self.pending.push_back(request);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn processing_len(&self) -> usize {
        self.processing.len()
    }

    /// Removes the oldest pending request without changing its status.
    fn pop_pending(&mut self) -> Option<R> {
        self.pending.pop_front()
    }

    /// Marks a popped request as processing and tracks it.
    fn begin(&mut self, mut request: R, now_ms: u64) -> R {
        if let Err(err) = request.lifecycle_mut().mark_processing(now_ms) {
            warn!("{}", err);
        }
        self.processing.push(request.clone());
        request
    }

    /// Pops the oldest pending request and marks it processing.
    pub fn start_next(&mut self, now_ms: u64) -> Option<R> {
        let request = self.pop_pending()?;
        Some(self.begin(request, now_ms))
    }

    fn take_processing(&mut self, id: &RequestId) -> Option<R> {
        let index = self.processing.iter().position(|r| r.id() == id)?;
        Some(self.processing.swap_remove(index))
    }

    pub fn complete(
        &mut self,
        id: &RequestId,
        now_ms: u64,
        patch: impl FnOnce(&mut R),
    ) -> Option<R> {
        let mut request = self.take_processing(id)?;
        patch(&mut request);
        if let Err(err) = request.lifecycle_mut().mark_completed(now_ms) {
            warn!("{}", err);
        }
        self.completed.push(request.clone());
        Some(request)
    }

    pub fn fail(&mut self, id: &RequestId, now_ms: u64, error: impl Into<String>) -> Option<R> {
        let request = self.take_processing(id)?;
        Some(self.reject(request, now_ms, error))
    }

    /// Fails a request that was popped from pending but never started.
    fn reject(&mut self, mut request: R, now_ms: u64, error: impl Into<String>) -> R {
        if let Err(err) = request.lifecycle_mut().mark_failed(now_ms, error) {
            warn!("{}", err);
        }
        self.failed.push(request.clone());
        request
    }

    /// Fails the oldest pending request without starting it.
    pub fn reject_next(&mut self, now_ms: u64, error: impl Into<String>) -> Option<R> {
        let request = self.pop_pending()?;
        Some(self.reject(request, now_ms, error))
    }

    /// First pending or processing request matching `predicate`.
    pub fn find_active(&self, predicate: impl Fn(&R) -> bool) -> Option<&R> {
        self.pending
            .iter()
            .chain(self.processing.iter())
            .find(|r| predicate(r))
    }

    pub fn get(&self, id: &RequestId) -> Option<&R> {
        self.find_active(|r| r.id() == id)
            .or_else(|| self.completed.find(|r| r.id() == id))
            .or_else(|| self.failed.find(|r| r.id() == id))
    }

    pub fn snapshot(&self) -> RequestLogSnapshot<R> {
        let mut processing = self.processing.clone();
        processing.sort_by_key(|r| r.lifecycle().created_at);
        RequestLogSnapshot {
            pending: self.pending.iter().cloned().collect(),
            processing,
            completed: self.completed.iter().cloned().collect(),
            failed: self.failed.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use data_model::{DestroyReason, DestroyRequest, RequestStatus, VmId};

    use super::*;

    fn destroy(vm: &str, created_at: u64) -> DestroyRequest {
        DestroyRequest::new(VmId::from(vm), DestroyReason::Requested, None, created_at)
    }

    #[test]
    fn test_requests_start_in_creation_order() {
        let mut log = RequestLog::new(10);
        log.enqueue(destroy("a", 1));
        log.enqueue(destroy("b", 2));

        let first = log.start_next(5).unwrap();
        assert_eq!(first.vm_id, VmId::from("a"));
        assert_eq!(first.status(), RequestStatus::Processing);
        assert_eq!(first.lifecycle.started_at, Some(5));
        assert_eq!(log.pending_len(), 1);
        assert_eq!(log.processing_len(), 1);
    }

    #[test]
    fn test_complete_and_fail_move_to_history() {
        let mut log = RequestLog::new(10);
        log.enqueue(destroy("a", 1));
        log.enqueue(destroy("b", 2));
        let a = log.start_next(5).unwrap();
        let b = log.start_next(5).unwrap();

        let done = log.complete(a.id(), 6, |r| r.detail = Some("ok".into())).unwrap();
        assert_eq!(done.status(), RequestStatus::Completed);
        assert_eq!(done.detail.as_deref(), Some("ok"));

        let failed = log.fail(b.id(), 7, "boom").unwrap();
        assert_eq!(failed.lifecycle.error.as_deref(), Some("boom"));

        // a request can only leave processing once
        assert!(log.complete(a.id(), 8, |_| {}).is_none());

        let snapshot = log.snapshot();
        assert!(snapshot.pending.is_empty());
        assert!(snapshot.processing.is_empty());
        assert_eq!(snapshot.completed.len(), 1);
        assert_eq!(snapshot.failed.len(), 1);
        assert_eq!(log.get(b.id()).unwrap().status(), RequestStatus::Failed);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut log = RequestLog::new(2);
        for i in 0..5 {
            log.enqueue(destroy(&format!("vm{}", i), i));
            let request = log.start_next(i).unwrap();
            log.complete(request.id(), i, |_| {});
        }
        let completed = log.snapshot().completed;
        assert_eq!(completed.len(), 2);
        assert_eq!(completed[0].vm_id, VmId::from("vm3"));
    }

    #[test]
    fn test_reject_pending() {
        let mut log = RequestLog::new(10);
        log.enqueue(destroy("a", 1));
        log.enqueue(destroy("b", 2));
        let rejected = log.reject_next(3, "no capacity").unwrap();
        assert_eq!(rejected.vm_id, VmId::from("a"));
        assert_eq!(rejected.status(), RequestStatus::Failed);
        assert!(rejected.lifecycle.started_at.is_none());
        assert!(log.find_active(|r| r.vm_id == VmId::from("a")).is_none());
        assert_eq!(log.get(rejected.id()).unwrap().status(), RequestStatus::Failed);
        assert_eq!(log.pending_len(), 1);
    }
}
