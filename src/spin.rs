// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Spin waiting.
//!
//! The commit and send paths wait by yielding rather than parking. How long a
//! waiter keeps yielding before it starts sleeping (and how long it may
//! sleep) is a [`SpinPolicy`]; the default never sleeps longer than a
//! millisecond.

use serde::{Deserialize, Serialize};
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpinPolicy {
    /// Plain yields before backing off.
    pub yield_spins: u32,
    /// First sleep once yielding is exhausted, in microseconds.
    pub base_backoff_us: u64,
    /// Ceiling for the doubling sleep. Zero means yield forever.
    pub max_backoff_us: u64,
}

impl Default for SpinPolicy {
    fn default() -> Self {
        Self {
            yield_spins: 64,
            base_backoff_us: 20,
            max_backoff_us: 1_000,
        }
    }
}

impl SpinPolicy {
    /// Yield forever, never sleep.
    pub const fn busy() -> Self {
        Self {
            yield_spins: u32::MAX,
            base_backoff_us: 0,
            max_backoff_us: 0,
        }
    }
}

pub struct Spinner {
    policy: SpinPolicy,
    spins: u32,
    backoff_us: u64,
}

impl Spinner {
    pub fn new(policy: SpinPolicy) -> Self {
        Self {
            policy,
            spins: 0,
            backoff_us: policy.base_backoff_us,
        }
    }

    pub async fn spin(&mut self) {
        if self.spins < self.policy.yield_spins || self.policy.max_backoff_us == 0 {
            self.spins = self.spins.saturating_add(1);
            tokio::task::yield_now().await;
            return;
        }
        tokio::time::sleep(Duration::from_micros(self.backoff_us.max(1))).await;
        self.backoff_us = (self.backoff_us * 2).min(self.policy.max_backoff_us);
    }

    pub fn reset(&mut self) {
        self.spins = 0;
        self.backoff_us = self.policy.base_backoff_us;
    }
}

/// Who holds a [`SpinLock`]. The value is only a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockRole {
    Append = 1,
    Send = 2,
    Trim = 3,
    Checkpoint = 4,
}

impl LockRole {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(LockRole::Append),
            2 => Some(LockRole::Send),
            3 => Some(LockRole::Trim),
            4 => Some(LockRole::Checkpoint),
            _ => None,
        }
    }
}

/// Compare-and-swap lock whose held value names the holder's role.
///
/// # Invariants
/// - `state == 0` iff unlocked.
/// - Critical sections never await.
pub struct SpinLock<T> {
    state: AtomicU8,
    value: UnsafeCell<T>,
}

// SAFETY: access to `value` is serialised by `state`; a guard exists only
// after a successful 0 -> role CAS and releases with a store of 0.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            state: AtomicU8::new(0),
            value: UnsafeCell::new(value),
        }
    }

    pub fn try_lock(&self, role: LockRole) -> Option<SpinGuard<'_, T>> {
        self.state
            .compare_exchange(0, role as u8, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinGuard { lock: self })
    }

    pub fn lock(&self, role: LockRole) -> SpinGuard<'_, T> {
        let mut spins = 0u32;
        loop {
            if let Some(guard) = self.try_lock(role) {
                return guard;
            }
            spins += 1;
            if spins % 64 == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }

    /// Current holder, if any.
    pub fn holder(&self) -> Option<LockRole> {
        LockRole::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

pub struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive access.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive access.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.store(0, Ordering::Release);
    }
}
