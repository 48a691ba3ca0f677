//! Interlocked-style atomic operations (replaces atomic.h)
//!
//! Every operation is a full barrier (`SeqCst`) and behaves like the Win32
//! `Interlocked*` family regardless of target. Arithmetic wraps on overflow.

use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

/// Interlocked operations over one integer width.
pub trait Interlocked {
    type Value: Copy;

    /// Stores `exchange` if the current value equals `comparand`.
    /// Always returns the value observed before the comparison.
    fn compare_exchange(&self, exchange: Self::Value, comparand: Self::Value) -> Self::Value;

    /// Adds one and returns the new value.
    fn increment(&self) -> Self::Value;

    /// Subtracts one and returns the new value.
    fn decrement(&self) -> Self::Value;

    /// Stores `value` and returns the previous value.
    fn exchange(&self, value: Self::Value) -> Self::Value;

    /// Adds `increment` and returns the previous value.
    fn exchange_add(&self, increment: Self::Value) -> Self::Value;
}

macro_rules! impl_interlocked {
    ($atomic:ty, $value:ty) => {
        impl Interlocked for $atomic {
            type Value = $value;

            #[inline]
            fn compare_exchange(&self, exchange: $value, comparand: $value) -> $value {
                match <$atomic>::compare_exchange(
                    self,
                    comparand,
                    exchange,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(old) | Err(old) => old,
                }
            }

            #[inline]
            fn increment(&self) -> $value {
                self.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
            }

            #[inline]
            fn decrement(&self) -> $value {
                self.fetch_sub(1, Ordering::SeqCst).wrapping_sub(1)
            }

            #[inline]
            fn exchange(&self, value: $value) -> $value {
                self.swap(value, Ordering::SeqCst)
            }

            #[inline]
            fn exchange_add(&self, increment: $value) -> $value {
                self.fetch_add(increment, Ordering::SeqCst)
            }
        }
    };
}

impl_interlocked!(AtomicI32, i32);
impl_interlocked!(AtomicI64, i64);

// 32-bit free functions, named after the calls the lock code reads like.

#[inline]
pub fn interlocked_compare_exchange(dest: &AtomicI32, exchange: i32, comparand: i32) -> i32 {
    Interlocked::compare_exchange(dest, exchange, comparand)
}

#[inline]
pub fn interlocked_increment(dest: &AtomicI32) -> i32 {
    Interlocked::increment(dest)
}

#[inline]
pub fn interlocked_decrement(dest: &AtomicI32) -> i32 {
    Interlocked::decrement(dest)
}

#[inline]
pub fn interlocked_exchange(dest: &AtomicI32, value: i32) -> i32 {
    Interlocked::exchange(dest, value)
}

#[inline]
pub fn interlocked_exchange_add(dest: &AtomicI32, increment: i32) -> i32 {
    Interlocked::exchange_add(dest, increment)
}
