//! Call handles and the transport boundary.

use crate::arena::{ArenaHandle, CallArena};
use crate::batch::{Batch, BatchResult, BatchSlot};
use crate::completion::{CompletionQueue, Event};
use crate::context::ClientContext;
use crate::metrics::{BATCHES_COMPLETED, BATCHES_FAILED, BATCHES_SUBMITTED};
use crate::status::Status;

use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Identifies one call within a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(u64);

impl CallId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An RPC method, addressed by path ("/package.Service/Method").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Method {
    path: String,
}

impl Method {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// The transport side of a call.
///
/// `start_batch` must eventually lead to exactly one
/// [`Call::complete_batch`] for the batch, including when the call is
/// cancelled or torn down.
pub trait CallTransport: Send + Sync {
    fn start_batch(&self, call: &Call, batch: BatchRef);

    fn cancel(&self, call: &Call);
}

/// Creates client calls.
pub trait ChannelInterface {
    fn create_call(&self, method: &Method, context: &ClientContext, cq: &CompletionQueue) -> Call;
}

/// A driver's batches, stored as fields of one arena object.
pub trait OpSetCollection: Any + Send {
    fn op_set_mut(&mut self, slot: BatchSlot) -> Option<&mut Batch>;
}

type Resolve = for<'a> fn(&'a mut (dyn Any + 'static), BatchSlot) -> Option<&'a mut Batch>;

fn resolve<'a, T: OpSetCollection>(
    object: &'a mut (dyn Any + 'static),
    slot: BatchSlot,
) -> Option<&'a mut Batch> {
    object.downcast_mut::<T>()?.op_set_mut(slot)
}

/// Reference to a batch living in a call arena.
#[derive(Clone, Copy)]
pub struct BatchRef {
    call: CallId,
    index: u32,
    slot: BatchSlot,
    resolve: Resolve,
}

impl BatchRef {
    pub fn new<T: OpSetCollection>(collection: ArenaHandle<T>, slot: BatchSlot) -> Self {
        Self {
            call: collection.call(),
            index: collection.index(),
            slot,
            resolve: resolve::<T>,
        }
    }

    pub fn slot(&self) -> BatchSlot {
        self.slot
    }

    fn get<'a>(&self, arena: &'a mut CallArena) -> Option<&'a mut Batch> {
        let object = arena.get_any_mut(self.index)?;
        (self.resolve)(object, self.slot)
    }
}

impl fmt::Debug for BatchRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchRef")
            .field("call", &self.call)
            .field("index", &self.index)
            .field("slot", &self.slot)
            .finish()
    }
}

struct CallInner {
    id: CallId,
    method: Method,
    cq: CompletionQueue,
    arena: Mutex<CallArena>,
    transport: Weak<dyn CallTransport>,
}

/// Handle to one in-flight call.
///
/// Clones refer to the same call. The call's arena, and every driver object
/// carved from it, is released when the last handle is dropped.
#[derive(Clone)]
pub struct Call {
    inner: Arc<CallInner>,
}

impl Call {
    /// Create a call bound to `transport`. Completions are posted to `cq`.
    pub fn new(
        id: CallId,
        method: Method,
        cq: CompletionQueue,
        transport: Weak<dyn CallTransport>,
    ) -> Self {
        Self {
            inner: Arc::new(CallInner {
                id,
                method,
                cq,
                arena: Mutex::new(CallArena::new(id)),
                transport,
            }),
        }
    }

    pub fn id(&self) -> CallId {
        self.inner.id
    }

    pub fn method(&self) -> &Method {
        &self.inner.method
    }

    pub fn completion_queue(&self) -> &CompletionQueue {
        &self.inner.cq
    }

    /// Carve `value` out of this call's arena.
    pub fn alloc<T: Any + Send>(&self, value: T) -> ArenaHandle<T> {
        self.inner.arena.lock().alloc(value)
    }

    /// Run `f` on an object of this call's arena.
    ///
    /// # Panics
    ///
    /// If the handle belongs to another call.
    pub fn with_object<T: Any, R>(&self, handle: ArenaHandle<T>, f: impl FnOnce(&mut T) -> R) -> R {
        let mut arena = self.inner.arena.lock();
        let object = arena
            .get_mut(handle)
            .unwrap_or_else(|| panic!("{:?} does not belong to call {}", handle, self.id()));
        f(object)
    }

    /// Run `f` on a batch of this call.
    ///
    /// # Panics
    ///
    /// If the batch reference belongs to another call.
    pub fn with_batch<R>(&self, batch: &BatchRef, f: impl FnOnce(&mut Batch) -> R) -> R {
        assert_eq!(batch.call, self.id(), "batch belongs to another call");
        let mut arena = self.inner.arena.lock();
        let batch = batch
            .get(&mut arena)
            .unwrap_or_else(|| panic!("no batch at {:?} in call {}", batch, self.id()));
        f(batch)
    }

    pub fn arena_allocations(&self) -> usize {
        self.inner.arena.lock().allocations()
    }

    pub fn arena_bytes(&self) -> usize {
        self.inner.arena.lock().allocated_bytes()
    }

    /// Submit a configured batch.
    ///
    /// # Panics
    ///
    /// If the batch was already submitted.
    pub fn perform_ops(&self, batch: BatchRef) {
        let tag = self.with_batch(&batch, |b| b.mark_submitted());
        if tag.is_some() {
            self.inner.cq.register();
        }
        BATCHES_SUBMITTED.increment();
        trace!(call = %self.id(), slot = ?batch.slot, ?tag, "batch submitted");

        match self.inner.transport.upgrade() {
            Some(transport) => transport.start_batch(self, batch),
            None => {
                debug!(call = %self.id(), "transport gone, failing batch");
                let result = BatchResult::failed(Status::unavailable("transport closed"));
                self.complete_batch(&batch, result);
            }
        }
    }

    /// Finish a submitted batch and post its tag, if any.
    ///
    /// Called by transports exactly once per submitted batch.
    pub fn complete_batch(&self, batch: &BatchRef, result: BatchResult) {
        let (tag, ok) = self.with_batch(batch, |b| {
            let ok = b.complete(result);
            (b.tag(), ok)
        });

        BATCHES_COMPLETED.increment();
        if !ok {
            BATCHES_FAILED.increment();
        }
        trace!(call = %self.id(), slot = ?batch.slot, ?tag, ok, "batch completed");

        if let Some(tag) = tag {
            self.inner.cq.post(Event { tag, ok });
        }
    }

    /// Cancel the call. Outstanding and later batches fail.
    pub fn cancel(&self) {
        debug!(call = %self.id(), method = self.method().path(), "cancelling call");
        if let Some(transport) = self.inner.transport.upgrade() {
            transport.cancel(self);
        }
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.inner.id)
            .field("method", &self.inner.method)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{Op, OpKind};
    use crate::completion::Tag;
    use crate::testing::RecordingTransport;

    const SHAPE: &[OpKind] = &[OpKind::ClientSendClose];

    struct Single {
        batch: Batch,
    }

    impl OpSetCollection for Single {
        fn op_set_mut(&mut self, slot: BatchSlot) -> Option<&mut Batch> {
            match slot {
                BatchSlot::Finish => Some(&mut self.batch),
                _ => None,
            }
        }
    }

    fn single(call: &Call, tag: Option<Tag>) -> BatchRef {
        let mut batch = Batch::new(SHAPE);
        batch.configure(Op::ClientSendClose);
        if let Some(tag) = tag {
            batch.set_output_tag(tag);
        }
        BatchRef::new(call.alloc(Single { batch }), BatchSlot::Finish)
    }

    #[test]
    fn test_tagged_batch_posts_one_event() {
        let transport = RecordingTransport::new();
        let cq = CompletionQueue::new();
        let call = transport.call(&cq);

        let batch = single(&call, Some(Tag::new(11)));
        call.perform_ops(batch);
        assert_eq!(cq.outstanding(), 1);
        assert!(cq.try_next().is_none());

        transport.complete_next(BatchResult::success());
        assert_eq!(cq.try_next(), Some(Event { tag: Tag::new(11), ok: true }));
        assert_eq!(cq.outstanding(), 0);
        assert!(call.with_batch(&batch, |b| b.is_completed()));
    }

    #[test]
    fn test_untagged_batch_completes_silently() {
        let transport = RecordingTransport::new();
        let cq = CompletionQueue::new();
        let call = transport.call(&cq);

        let batch = single(&call, None);
        call.perform_ops(batch);
        transport.complete_next(BatchResult::success());

        assert!(cq.try_next().is_none());
        assert_eq!(cq.outstanding(), 0);
        assert!(call.with_batch(&batch, |b| b.is_completed()));
    }

    #[test]
    fn test_batch_fails_when_transport_is_gone() {
        let transport = RecordingTransport::new();
        let cq = CompletionQueue::new();
        let call = transport.call(&cq);
        drop(transport);

        call.perform_ops(single(&call, Some(Tag::new(5))));
        assert_eq!(cq.try_next(), Some(Event { tag: Tag::new(5), ok: false }));
    }

    #[test]
    #[should_panic(expected = "batch belongs to another call")]
    fn test_foreign_batch_is_a_fault() {
        let transport = RecordingTransport::new();
        let cq = CompletionQueue::new();
        let first = transport.call(&cq);
        let second = transport.call(&cq);

        let batch = single(&first, None);
        second.perform_ops(batch);
    }

    #[test]
    fn test_arena_released_with_last_handle() {
        let transport = RecordingTransport::new();
        let cq = CompletionQueue::new();
        let call = transport.call(&cq);
        let weak = Arc::downgrade(&call.inner);

        single(&call, None);
        assert_eq!(call.arena_allocations(), 1);
        assert!(call.arena_bytes() >= std::mem::size_of::<Single>());

        let clone = call.clone();
        drop(call);
        assert!(weak.upgrade().is_some());
        drop(clone);
        assert!(weak.upgrade().is_none());
    }
}
