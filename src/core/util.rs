// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// An ergonomic wrapper around a [`Mutex`]-[`Condvar`] pair.
pub struct Status<T> {
    mutex: Mutex<T>,
    condvar: Condvar,
}

impl<T> Status<T> {
    /// Creates a new status initialized with the given value.
    pub fn new(t: T) -> Self {
        Self {
            mutex: Mutex::new(t),
            condvar: Condvar::new(),
        }
    }

    /// Locks the status, to inspect it without waiting.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.mutex.lock().unwrap()
    }

    /// Sets the status to the given value and notifies all waiting threads.
    pub fn notify_all(&self, t: T) {
        *self.mutex.lock().unwrap() = t;
        self.condvar.notify_all();
    }

    /// Notifies all waiting threads, without changing the status.
    pub fn wake_all(&self) {
        self.condvar.notify_all();
    }

    /// Applies the given function to the status and notifies all waiting
    /// threads.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = f(&mut self.mutex.lock().unwrap());
        self.condvar.notify_all();
        result
    }

    /// Waits until the predicate is false on this status.
    ///
    /// This returns a [`MutexGuard`], allowing to further inspect or modify the
    /// status.
    pub fn wait_while(&self, predicate: impl FnMut(&mut T) -> bool) -> MutexGuard<'_, T> {
        self.condvar
            .wait_while(self.mutex.lock().unwrap(), predicate)
            .unwrap()
    }

    /// Waits until the predicate is false on this status, or until the timeout
    /// expires.
    ///
    /// The returned boolean is true if the timeout expired while the predicate
    /// was still true.
    pub fn wait_timeout_while(
        &self,
        timeout: Duration,
        predicate: impl FnMut(&mut T) -> bool,
    ) -> (MutexGuard<'_, T>, bool) {
        let (guard, result) = self
            .condvar
            .wait_timeout_while(self.mutex.lock().unwrap(), timeout, predicate)
            .unwrap();
        (guard, result.timed_out())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{Arc, Barrier};

    #[test]
    fn status_notify_wakes_waiter() {
        let status = Arc::new(Status::new(0));
        let barrier = Arc::new(Barrier::new(2));

        let waiter = std::thread::spawn({
            let status = status.clone();
            let barrier = barrier.clone();
            move || {
                barrier.wait();
                *status.wait_while(|x| *x < 3)
            }
        });

        barrier.wait();
        for i in 1..=3 {
            status.update(|x| *x = i);
        }
        assert_eq!(waiter.join().unwrap(), 3);
    }

    #[test]
    fn status_wait_timeout_expires() {
        let status = Status::new(false);
        let (guard, timed_out) = status.wait_timeout_while(Duration::from_millis(10), |x| !*x);
        assert!(timed_out);
        assert!(!*guard);
    }

    #[test]
    fn status_wait_timeout_satisfied() {
        let status = Status::new(true);
        let (guard, timed_out) = status.wait_timeout_while(Duration::from_secs(10), |x| !*x);
        assert!(!timed_out);
        assert!(*guard);
    }

    #[test]
    fn status_update_returns_value() {
        let status = Status::new(vec![1, 2]);
        let len = status.update(|v| {
            v.push(3);
            v.len()
        });
        assert_eq!(len, 3);
        status.notify_all(Vec::new());
        assert!(status.lock().is_empty());
    }
}
