//! Runtime-side representation of loaded code: the value model shared with
//! the dispatcher and field store, well-known intrinsic member references,
//! and loaded modules with swappable method bodies.

pub mod intrinsics;
pub mod loaded;
pub mod value;

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// A poisoned lock only means another thread panicked mid-update; the patch
// engine's tables stay usable, so recover the guard instead of unwinding.

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read_lock<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}
