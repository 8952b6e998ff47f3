//! Per-call arena.
//!
//! Driver state for a call is carved out of the call's arena and lives
//! exactly as long as the call. Objects are released together when the
//! arena is dropped; there is no way to free a single allocation.
//!
//! The arena is not one contiguous region. Each object is boxed
//! separately and the arena owns the boxes, which is enough to tie every
//! object's lifetime to the call. Drivers keep their whole state in a
//! single object, so a call costs one box per driver.

use crate::call::CallId;
use crate::metrics::ARENA_ALLOCATIONS;

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use tracing::trace;

/// Typed reference to an object in a call arena.
///
/// A handle is only valid against the arena of the call that produced it.
pub struct ArenaHandle<T> {
    call: CallId,
    index: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ArenaHandle<T> {
    /// The call whose arena holds the object.
    pub fn call(&self) -> CallId {
        self.call
    }

    pub(crate) fn index(&self) -> u32 {
        self.index
    }
}

impl<T> Clone for ArenaHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ArenaHandle<T> {}

impl<T> PartialEq for ArenaHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.call == other.call && self.index == other.index
    }
}

impl<T> Eq for ArenaHandle<T> {}

impl<T> fmt::Debug for ArenaHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArenaHandle")
            .field("call", &self.call)
            .field("index", &self.index)
            .finish()
    }
}

/// Region holding every auxiliary object of one call.
pub struct CallArena {
    call: CallId,
    objects: Vec<Box<dyn Any + Send>>,
    bytes: usize,
}

impl CallArena {
    pub(crate) fn new(call: CallId) -> Self {
        Self {
            call,
            objects: Vec::new(),
            bytes: 0,
        }
    }

    /// Move `value` into the arena.
    pub fn alloc<T: Any + Send>(&mut self, value: T) -> ArenaHandle<T> {
        let index = self.objects.len() as u32;
        self.bytes += std::mem::size_of::<T>();
        self.objects.push(Box::new(value));
        ARENA_ALLOCATIONS.increment();
        trace!(call = %self.call, index, size = std::mem::size_of::<T>(), "arena allocation");
        ArenaHandle {
            call: self.call,
            index,
            _marker: PhantomData,
        }
    }

    pub fn get<T: Any>(&self, handle: ArenaHandle<T>) -> Option<&T> {
        if handle.call != self.call {
            return None;
        }
        self.objects.get(handle.index as usize)?.downcast_ref()
    }

    pub fn get_mut<T: Any>(&mut self, handle: ArenaHandle<T>) -> Option<&mut T> {
        if handle.call != self.call {
            return None;
        }
        self.objects.get_mut(handle.index as usize)?.downcast_mut()
    }

    pub(crate) fn get_any_mut(&mut self, index: u32) -> Option<&mut (dyn Any + Send + 'static)> {
        self.objects.get_mut(index as usize).map(|object| &mut **object)
    }

    /// Number of allocations made from this arena.
    pub fn allocations(&self) -> usize {
        self.objects.len()
    }

    /// Bytes of driver state held by this arena.
    pub fn allocated_bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for CallArena {
    fn drop(&mut self) {
        trace!(
            call = %self.call,
            allocations = self.objects.len(),
            bytes = self.bytes,
            "releasing call arena"
        );
    }
}

impl fmt::Debug for CallArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallArena")
            .field("call", &self.call)
            .field("allocations", &self.objects.len())
            .field("bytes", &self.bytes)
            .finish()
    }
}
