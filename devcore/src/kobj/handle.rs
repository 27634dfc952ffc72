//! Counted handles for registry objects.
//!
//! Provide two complementary handle types:
//! - [Handle<T>] owns a strong reference backed by [Arc]. Every live handle is one reference on
//!   the object; [Handle::acquire] takes another, [Handle::release] (or simply dropping the
//!   handle) gives one back.
//! - [HandleRef<T>] stores a weak reference ([Weak]) and is used for parent back-references and
//!   other non-owning links that must not keep the target alive.
//!
//! Key guarantees and semantics:
//! - The count is atomic. The transition to zero happens exactly once no matter how many owners
//!   release concurrently, and only then does the object's `Drop` run (for a
//!   [Device](crate::dev::Device) that is the devres teardown followed by its release handler).
//! - Call [HandleRef::get_handle] to attempt an upgrade; it returns [None] once the last strong
//!   owner is gone. **Consumers must handle the [None] case explicitly.**
use std::sync::{Arc, Weak};

use core::{fmt::Debug, ops::Deref};

use super::{Kobj, KobjPtr};

/// Strong owning handle backed by [Arc<T>].
pub struct Handle<T> {
    inner: Arc<T>,
}

impl<T> Deref for Handle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> From<T> for Handle<T> {
    fn from(value: T) -> Self {
        Self {
            inner: Arc::new(value),
        }
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Debug> Debug for Handle<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.inner.fmt(f)
    }
}

impl<T> Handle<T> {
    /// Take one more reference on `handle`. A missing handle stays missing.
    pub fn acquire(handle: Option<&Handle<T>>) -> Option<Handle<T>> {
        handle.cloned()
    }

    /// Give back the reference held by this handle.
    ///
    /// Equivalent to dropping it; spelled out where the release point matters.
    pub fn release(self) {
        drop(self)
    }

    /// Current number of strong references.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn ptr_eq(a: &Handle<T>, b: &Handle<T>) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Create a non-owning [HandleRef<T>] that refers to the same underlying object.
    pub fn create_ref(&self) -> HandleRef<T> {
        HandleRef {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl<T: Kobj + 'static> Handle<T> {
    /// Type-erased view of this object as a hierarchy node.
    pub fn node(&self) -> KobjPtr {
        self.inner.clone()
    }
}

/// Weak (non-owning) handle backed by [Weak<T>].
pub struct HandleRef<T> {
    inner: Weak<T>,
}

impl<T> Clone for HandleRef<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Debug for HandleRef<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandleRef")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl<T> HandleRef<T> {
    /// Attempt to upgrade the weak reference into a strong [Handle<T>].
    ///
    /// Return `Some(Handle<T>)` if the target is still alive, otherwise return `None`.
    pub fn get_handle(&self) -> Option<Handle<T>> {
        Weak::upgrade(&self.inner).map(|arc| Handle { inner: arc })
    }

    /// Whether this reference points at the object owned by `handle`.
    pub fn refers_to(&self, handle: &Handle<T>) -> bool {
        core::ptr::eq(self.inner.as_ptr(), Arc::as_ptr(&handle.inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
    };

    struct Counted<'a> {
        released: &'a AtomicUsize,
    }

    impl Drop for Counted<'_> {
        fn drop(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn acquire_of_nothing_is_nothing() {
        assert!(Handle::<u32>::acquire(None).is_none());
        let h = Handle::from(5u32);
        let h2 = Handle::acquire(Some(&h)).unwrap();
        assert!(Handle::ptr_eq(&h, &h2));
        assert_eq!(h.ref_count(), 2);
        h2.release();
        assert_eq!(h.ref_count(), 1);
    }

    #[test]
    fn weak_ref_does_not_keep_object_alive() {
        let released = AtomicUsize::new(0);
        let h = Handle::from(Counted { released: &released });
        let r = h.create_ref();
        assert!(r.refers_to(&h));
        assert!(r.get_handle().is_some());
        h.release();
        assert!(r.get_handle().is_none());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_release_fires_once() {
        static RELEASED: AtomicUsize = AtomicUsize::new(0);
        for _ in 0..50 {
            RELEASED.store(0, Ordering::SeqCst);
            let h = Handle::from(Counted { released: &RELEASED });
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    let mine = Handle::acquire(Some(&h)).unwrap();
                    thread::spawn(move || {
                        for _ in 0..100 {
                            let extra = mine.clone();
                            assert_eq!(RELEASED.load(Ordering::SeqCst), 0);
                            extra.release();
                        }
                        mine.release();
                    })
                })
                .collect();
            h.release();
            for w in workers {
                w.join().unwrap();
            }
            assert_eq!(RELEASED.load(Ordering::SeqCst), 1);
        }
    }
}
