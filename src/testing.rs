//! A transport that records batches and completes them on request.

use crate::batch::{BatchResult, Op, OpKind};
use crate::call::{BatchRef, Call, CallId, CallTransport, ChannelInterface, Method};
use crate::completion::{CompletionQueue, Tag};
use crate::context::ClientContext;
use crate::status::Status;

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

/// A batch as it was handed to the transport.
#[derive(Debug, Clone)]
pub struct Submitted {
    pub call: CallId,
    pub kinds: Vec<OpKind>,
    pub ops: Vec<Op>,
    pub tag: Option<Tag>,
}

#[derive(Default)]
struct Recorder {
    next_id: Mutex<u64>,
    submitted: Mutex<Vec<Submitted>>,
    pending: Mutex<VecDeque<(Call, BatchRef)>>,
    cancelled: Mutex<Vec<CallId>>,
}

impl CallTransport for Recorder {
    fn start_batch(&self, call: &Call, batch: BatchRef) {
        let submitted = call.with_batch(&batch, |b| Submitted {
            call: call.id(),
            kinds: b.kinds(),
            ops: b.ops().to_vec(),
            tag: b.tag(),
        });
        self.submitted.lock().push(submitted);
        self.pending.lock().push_back((call.clone(), batch));
    }

    fn cancel(&self, call: &Call) {
        self.cancelled.lock().push(call.id());
    }
}

pub struct RecordingTransport {
    inner: Arc<Recorder>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Recorder::default()),
        }
    }

    /// Create a call bound to this transport.
    pub fn call(&self, cq: &CompletionQueue) -> Call {
        self.new_call(Method::new("/test.Service/Call"), cq)
    }

    fn new_call(&self, method: Method, cq: &CompletionQueue) -> Call {
        let id = {
            let mut next = self.inner.next_id.lock();
            *next += 1;
            *next
        };
        let transport = Arc::downgrade(&self.inner) as Weak<dyn CallTransport>;
        Call::new(CallId::new(id), method, cq.clone(), transport)
    }

    pub fn submitted(&self) -> Vec<Submitted> {
        self.inner.submitted.lock().clone()
    }

    pub fn cancelled(&self) -> Vec<CallId> {
        self.inner.cancelled.lock().clone()
    }

    /// Complete the oldest pending batch with `result`.
    ///
    /// # Panics
    ///
    /// If no batch is pending.
    pub fn complete_next(&self, result: BatchResult) {
        let (call, batch) = self
            .inner
            .pending
            .lock()
            .pop_front()
            .expect("no pending batch");
        call.complete_batch(&batch, result);
    }

    /// Fail every pending batch.
    pub fn fail_all(&self, status: Status) {
        let pending: Vec<_> = self.inner.pending.lock().drain(..).collect();
        for (call, batch) in pending {
            call.complete_batch(&batch, BatchResult::failed(status.clone()));
        }
    }
}

impl ChannelInterface for RecordingTransport {
    fn create_call(&self, method: &Method, _context: &ClientContext, cq: &CompletionQueue) -> Call {
        self.new_call(method.clone(), cq)
    }
}
