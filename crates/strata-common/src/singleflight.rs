//! Request coalescing for concurrent identical lookups
//!
//! A single-flight map runs at most one closure per key at a time; callers
//! that arrive while a call is in flight block and receive the leader's
//! result (or its error). Entries are removed when the call completes, so
//! the map is empty between calls.

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;

struct CallState<T> {
    done: bool,
    result: Option<Result<T>>,
}

struct Call<T> {
    state: Mutex<CallState<T>>,
    cv: Condvar,
}

impl<T: Clone> Call<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(CallState {
                done: false,
                result: None,
            }),
            cv: Condvar::new(),
        }
    }

    fn wait(&self) -> Result<T> {
        let mut state = self.state.lock();
        while !state.done {
            self.cv.wait(&mut state);
        }
        state
            .result
            .clone()
            .unwrap_or_else(|| Err(Error::io("single-flight call finished without a result")))
    }

    fn complete(&self, result: Result<T>) {
        let mut state = self.state.lock();
        state.result = Some(result);
        state.done = true;
        drop(state);
        self.cv.notify_all();
    }
}

/// Per-key call deduplication map
pub struct SingleFlight<T> {
    calls: Mutex<HashMap<String, Arc<Call<T>>>>,
}

impl<T: Clone> SingleFlight<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` for `key`, or join a call already in flight for it
    ///
    /// Exactly one closure executes per key at a time; every concurrent
    /// caller observes the same result or the same error.
    pub fn run<F>(&self, key: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let call = {
            let mut calls = self.calls.lock();
            if let Some(existing) = calls.get(key) {
                let existing = Arc::clone(existing);
                drop(calls);
                return existing.wait();
            }
            let call = Arc::new(Call::new());
            calls.insert(key.to_string(), Arc::clone(&call));
            call
        };

        let result = f();

        // Remove our entry before waking waiters; a forget() may already
        // have replaced it with a newer call, which must be left alone.
        {
            let mut calls = self.calls.lock();
            if calls.get(key).is_some_and(|c| Arc::ptr_eq(c, &call)) {
                calls.remove(key);
            }
        }

        call.complete(result.clone());
        result
    }

    /// Join an in-flight call for `key`, or return `None` immediately
    pub fn try_piggyback(&self, key: &str) -> Option<Result<T>> {
        let call = {
            let calls = self.calls.lock();
            calls.get(key).map(Arc::clone)
        }?;
        Some(call.wait())
    }

    /// Detach any in-flight entry so later callers start a fresh call
    ///
    /// Current waiters still receive the detached call's result.
    pub fn forget(&self, key: &str) {
        self.calls.lock().remove(key);
    }

    /// Number of calls currently in flight
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    #[test]
    fn test_single_caller() {
        let sf = SingleFlight::new();
        let value = sf.run("k", || Ok(42u64)).unwrap();
        assert_eq!(value, 42);
        assert_eq!(sf.in_flight(), 0);
    }

    #[test]
    fn test_concurrent_callers_share_one_execution() {
        let sf = Arc::new(SingleFlight::new());
        let counter = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let sf = Arc::clone(&sf);
            let counter = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                sf.run("k1", || {
                    let v = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    std::thread::sleep(Duration::from_millis(50));
                    Ok(v)
                })
            }));
        }

        let results: Vec<u64> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|&v| v == results[0]));
        assert_eq!(sf.in_flight(), 0);
    }

    #[test]
    fn test_error_propagates_to_waiters() {
        let sf = Arc::new(SingleFlight::<u64>::new());

        let leader = {
            let sf = Arc::clone(&sf);
            std::thread::spawn(move || {
                sf.run("k", || {
                    std::thread::sleep(Duration::from_millis(30));
                    Err(Error::io("backend down"))
                })
            })
        };
        std::thread::sleep(Duration::from_millis(10));
        let piggy = sf.try_piggyback("k");

        assert!(leader.join().unwrap().is_err());
        match piggy {
            Some(Err(Error::Io(msg))) => assert_eq!(msg, "backend down"),
            other => panic!("expected joined error, got {other:?}"),
        }
    }

    #[test]
    fn test_piggyback_without_inflight() {
        let sf = SingleFlight::<u64>::new();
        assert!(sf.try_piggyback("nothing").is_none());
    }

    #[test]
    fn test_forget_detaches_entry() {
        let sf = Arc::new(SingleFlight::new());

        let leader = {
            let sf = Arc::clone(&sf);
            std::thread::spawn(move || {
                sf.run("k", || {
                    std::thread::sleep(Duration::from_millis(50));
                    Ok(1u64)
                })
            })
        };
        std::thread::sleep(Duration::from_millis(10));
        sf.forget("k");

        // A fresh call may now run concurrently under the same key.
        let fresh = sf.run("k", || Ok(2u64)).unwrap();
        assert_eq!(fresh, 2);
        assert_eq!(leader.join().unwrap().unwrap(), 1);
    }

    #[test]
    fn test_keys_do_not_interfere() {
        let sf = SingleFlight::new();
        assert_eq!(sf.run("a", || Ok(1u64)).unwrap(), 1);
        assert_eq!(sf.run("b", || Ok(2u64)).unwrap(), 2);
    }
}
