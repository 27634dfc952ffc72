//! Lock-guarded lists with snapshot iteration.
//!
//! [LockedVec] is the list type behind every membership list in the driver core
//! (children of a device, devices on a bus, devices bound to a driver, ...).
//! Iteration never happens under the lock: callers take a [LockedVec::snapshot] and
//! walk it, so callbacks invoked per element are free to modify the list again.
use alloc::vec::Vec;
use core::fmt::Debug;
use spin::RwLock;

pub struct LockedVec<T> {
    inner: RwLock<Vec<T>>,
}

impl<T> LockedVec<T> {
    pub const fn new() -> LockedVec<T> {
        LockedVec {
            inner: RwLock::new(Vec::new()),
        }
    }

    /// Append `value` at the tail. Return its index at the time of insertion.
    pub fn push(&self, value: T) -> usize {
        let mut guard = self.inner.write();
        let index = guard.len();
        guard.push(value);
        index
    }

    /// Append `value` unless an element for which `same` holds is already present.
    ///
    /// Return `false` (and drop nothing) when the element was already there; the check and the
    /// insertion happen under one write lock.
    pub fn push_unique(&self, value: T, mut same: impl FnMut(&T, &T) -> bool) -> bool {
        let mut guard = self.inner.write();
        if guard.iter().any(|x| same(x, &value)) {
            return false;
        }
        guard.push(value);
        true
    }

    /// Remove and return the first element matching `pred`, keeping the order of the rest.
    pub fn remove_first(&self, mut pred: impl FnMut(&T) -> bool) -> Option<T> {
        let mut guard = self.inner.write();
        let pos = guard.iter().position(|x| pred(x))?;
        Some(guard.remove(pos))
    }

    pub fn any(&self, pred: impl FnMut(&T) -> bool) -> bool {
        self.inner.read().iter().any(pred)
    }

    pub fn count(&self, mut pred: impl FnMut(&T) -> bool) -> usize {
        self.inner.read().iter().filter(|x| pred(x)).count()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Take every element out, leaving the list empty.
    pub fn drain(&self) -> Vec<T> {
        core::mem::take(&mut *self.inner.write())
    }
}

impl<T: Clone> LockedVec<T> {
    /// Copy of the current contents, in order.
    pub fn snapshot(&self) -> Vec<T> {
        self.inner.read().clone()
    }

    pub fn find(&self, mut pred: impl FnMut(&T) -> bool) -> Option<T> {
        self.inner.read().iter().find(|x| pred(x)).cloned()
    }
}

impl<T> Default for LockedVec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Debug> Debug for LockedVec<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.inner.read().iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_unique_rejects_duplicates() {
        let list = LockedVec::new();
        assert!(list.push_unique(1, |a, b| a == b));
        assert!(list.push_unique(2, |a, b| a == b));
        assert!(!list.push_unique(1, |a, b| a == b));
        assert_eq!(list.snapshot(), vec![1, 2]);
    }

    #[test]
    fn remove_first_keeps_order() {
        let list = LockedVec::new();
        for i in 0..5 {
            list.push(i);
        }
        assert_eq!(list.remove_first(|x| *x == 2), Some(2));
        assert_eq!(list.remove_first(|x| *x == 9), None);
        assert_eq!(list.snapshot(), vec![0, 1, 3, 4]);
    }

    #[test]
    fn snapshot_is_detached_from_list() {
        let list = LockedVec::new();
        list.push(10);
        let snap = list.snapshot();
        list.push(11);
        assert_eq!(snap, vec![10]);
        assert_eq!(list.len(), 2);
        assert_eq!(list.drain(), vec![10, 11]);
        assert!(list.is_empty());
    }
}
