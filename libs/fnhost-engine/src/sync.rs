//! Poison-tolerant lock helpers.
//!
//! A panic in user code is caught by the instance, so a poisoned lock only
//! means some other holder unwound. The guarded data is still consistent for
//! every structure in this crate; recover and keep going.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => {
            tracing::warn!("mutex was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

pub(crate) fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match l.read() {
        Ok(g) => g,
        Err(poisoned) => {
            tracing::warn!("read lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

pub(crate) fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match l.write() {
        Ok(g) => g,
        Err(poisoned) => {
            tracing::warn!("write lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}
