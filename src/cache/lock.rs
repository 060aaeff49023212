//! Poison-tolerant lock helpers.
//!
//! A panic while holding a guard must not take the whole bridge down, so
//! every acquisition recovers the inner value and logs where it happened.

use std::sync::{
    LockResult, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use tracing::warn;

fn recover<G>(
    acquired: LockResult<G>,
    kind: &'static str,
    source: &'static str,
    op: &'static str,
) -> G {
    acquired.unwrap_or_else(|poisoned: PoisonError<G>| {
        warn!(
            op,
            source,
            lock_kind = kind,
            "Recovered from poisoned lock"
        );
        poisoned.into_inner()
    })
}

pub(crate) fn rw_read<'a, T>(
    lock: &'a RwLock<T>,
    source: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    recover(lock.read(), "rwlock.read", source, op)
}

pub(crate) fn rw_write<'a, T>(
    lock: &'a RwLock<T>,
    source: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    recover(lock.write(), "rwlock.write", source, op)
}

pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    source: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    recover(lock.lock(), "mutex", source, op)
}
