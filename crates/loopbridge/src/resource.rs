//! ManagedResource - one native reference held for the wrapper's lifetime.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::registry::RuntimeRegistry;

/// A manually reference-counted object owned by the wrapped library.
///
/// # Safety
///
/// `retain` must add one reference and `release` must drop one; the object
/// must stay valid while at least one reference is held. Both may be called
/// from any thread, and `&Self` must be safe to use from any thread.
pub unsafe trait NativeObject: Send + Sync + 'static {
    unsafe fn retain(ptr: NonNull<Self>);
    unsafe fn release(ptr: NonNull<Self>);
}

pub struct ManagedResource<T: NativeObject> {
    ptr: NonNull<T>,
    runtime: Arc<RuntimeRegistry>,
}

// SAFETY: `NativeObject` requires thread-safe reference counting and shared
// access; the wrapper adds no unsynchronized state of its own.
unsafe impl<T: NativeObject> Send for ManagedResource<T> {}
unsafe impl<T: NativeObject> Sync for ManagedResource<T> {}

impl<T: NativeObject> ManagedResource<T> {
    /// Wrap a borrowed handle, acquiring a reference of our own.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live object.
    pub unsafe fn retain(runtime: &Arc<RuntimeRegistry>, ptr: NonNull<T>) -> Arc<Self> {
        T::retain(ptr);
        Self::adopt(runtime, ptr)
    }

    /// Wrap a handle whose reference is transferred to us, as returned by a
    /// native `*_finish` call.
    ///
    /// # Safety
    ///
    /// The caller must own one reference to `ptr` and give it up.
    pub unsafe fn adopt(runtime: &Arc<RuntimeRegistry>, ptr: NonNull<T>) -> Arc<Self> {
        tracing::trace!(ptr = ?ptr, ty = std::any::type_name::<T>(), "resource acquired");
        Arc::new(Self {
            ptr,
            runtime: Arc::clone(runtime),
        })
    }

    pub(crate) fn native(&self) -> &T {
        // SAFETY: we hold a reference for as long as `self` lives.
        unsafe { self.ptr.as_ref() }
    }

    pub fn runtime(&self) -> &Arc<RuntimeRegistry> {
        &self.runtime
    }
}

impl<T: NativeObject> Drop for ManagedResource<T> {
    fn drop(&mut self) {
        tracing::trace!(ptr = ?self.ptr, ty = std::any::type_name::<T>(), "resource released");
        // SAFETY: the reference taken in `retain`/`adopt` is released exactly once.
        unsafe { T::release(self.ptr) }
    }
}

impl<T: NativeObject> fmt::Debug for ManagedResource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedResource")
            .field("ptr", &self.ptr)
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}
