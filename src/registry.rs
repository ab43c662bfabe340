//! Registered rebinding requests
//!
//! Every registration call contributes one [`Batch`]. Batches form a singly
//! linked list with the newest batch at the head, so a slot is matched
//! against newer registrations before older ones. Batches linked into the
//! process-wide [`Registry`] are leaked on purpose: the loader may call back
//! into us for the rest of the process's life and every batch must still be
//! there when it does.

use crate::{Result, error::alloc_error};
use alloc::vec::Vec;
use core::{
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};

/// One symbol to rebind.
///
/// `name` is the symbol as written in source, without the leading underscore
/// the Mach-O symbol table carries.
#[derive(Clone, Copy, Debug)]
pub struct Rebinding<'a> {
    name: &'a str,
    replacement: *const (),
    replaced: Option<&'a AtomicPtr<()>>,
}

// The raw replacement pointer is only ever copied into pointer slots.
unsafe impl Send for Rebinding<'_> {}
unsafe impl Sync for Rebinding<'_> {}

impl<'a> Rebinding<'a> {
    /// Rebinds `name` to `replacement`.
    #[inline]
    pub const fn new(name: &'a str, replacement: *const ()) -> Self {
        Rebinding {
            name,
            replacement,
            replaced: None,
        }
    }

    /// Stores the value a slot held before it was rebound into `cell`.
    ///
    /// The cell receives the most recently bound value, which is the previous
    /// hook rather than the loader's own target when hooks are chained.
    #[inline]
    pub const fn with_replaced(mut self, cell: &'a AtomicPtr<()>) -> Self {
        self.replaced = Some(cell);
        self
    }

    #[inline]
    pub fn name(&self) -> &'a str {
        self.name
    }

    #[inline]
    pub fn replacement(&self) -> *const () {
        self.replacement
    }

    #[inline]
    pub fn replaced(&self) -> Option<&'a AtomicPtr<()>> {
        self.replaced
    }
}

/// The rebindings submitted by one registration call.
pub(crate) struct Batch<'a> {
    rebindings: &'a [Rebinding<'a>],
    next: Option<&'a Batch<'a>>,
}

impl<'a> Batch<'a> {
    #[inline]
    pub(crate) const fn new(rebindings: &'a [Rebinding<'a>], next: Option<&'a Batch<'a>>) -> Self {
        Batch { rebindings, next }
    }

    /// Finds the rebinding that applies to `name`.
    ///
    /// Walks this batch and then every older one; within a batch requests are
    /// tried in registration order. The first match wins.
    pub(crate) fn find(&self, name: &[u8]) -> Option<&'a Rebinding<'a>> {
        let mut cur = Some(self);
        while let Some(batch) = cur {
            if let Some(rebinding) = batch
                .rebindings
                .iter()
                .find(|rebinding| rebinding.name.as_bytes() == name)
            {
                return Some(rebinding);
            }
            cur = batch.next;
        }
        None
    }
}

/// Outcome of linking a batch into a [`Registry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Prepended {
    /// The registry was empty before this batch.
    First,
    /// Older batches were already registered.
    Subsequent,
}

/// Append-only, newest-first list of leaked batches.
pub(crate) struct Registry {
    head: AtomicPtr<Batch<'static>>,
}

impl Registry {
    pub(crate) const fn new() -> Self {
        Registry {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// The current newest batch, if any.
    #[inline]
    pub(crate) fn head(&self) -> Option<&'static Batch<'static>> {
        let head = self.head.load(Ordering::Acquire);
        // Nodes are leaked and never mutated after publication.
        unsafe { head.as_ref() }
    }

    /// Copies `rebindings` into leaked storage and links them at the head.
    ///
    /// All storage is reserved before anything is published, so on error the
    /// registry is unchanged.
    pub(crate) fn prepend(&self, rebindings: &[Rebinding<'static>]) -> Result<Prepended> {
        let rebindings = try_leak_slice(rebindings)?;
        let node = try_leak(Batch::new(rebindings, None))?;
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            // Safety: `node` is not yet shared, so this is the only reference to it.
            unsafe { (*node).next = head.as_ref() };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }
        Ok(if head.is_null() {
            Prepended::First
        } else {
            Prepended::Subsequent
        })
    }
}

/// Copies `items` into storage that lives for the rest of the process.
fn try_leak_slice<T: Copy>(items: &[T]) -> Result<&'static [T]> {
    let mut storage = Vec::new();
    storage
        .try_reserve_exact(items.len())
        .map_err(|_| alloc_error("out of memory while copying rebindings"))?;
    storage.extend_from_slice(items);
    Ok(storage.leak())
}

/// Moves `value` into storage that lives for the rest of the process.
fn try_leak<T>(value: T) -> Result<*mut T> {
    let mut storage = Vec::new();
    storage
        .try_reserve_exact(1)
        .map_err(|_| alloc_error("out of memory while linking a batch"))?;
    storage.push(value);
    Ok(storage.leak().as_mut_ptr())
}

/// A registry holding a single batch, used by one-image rebinding.
///
/// Unlike the global registry it owns its copy of the requests and releases
/// them when dropped.
pub(crate) struct TransientBatch<'a> {
    rebindings: Vec<Rebinding<'a>>,
}

impl<'a> TransientBatch<'a> {
    pub(crate) fn new(rebindings: &[Rebinding<'a>]) -> Result<Self> {
        let mut owned = Vec::new();
        owned
            .try_reserve_exact(rebindings.len())
            .map_err(|_| alloc_error("out of memory while copying rebindings"))?;
        owned.extend_from_slice(rebindings);
        Ok(TransientBatch { rebindings: owned })
    }

    #[inline]
    pub(crate) fn as_batch(&self) -> Batch<'_> {
        Batch::new(&self.rebindings, None)
    }
}
