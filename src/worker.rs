//! Single-activity background executor.
//!
//! The session runs its background work (monitoring, the starting sequence,
//! keep-alive) on a [`Worker`] that holds at most one activity. Spawning a new
//! activity cancels the current one and waits for its thread to finish first.
//! Cancellation is cooperative: activities wait through [`CancelToken::sleep`],
//! which returns early once the token is cancelled.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::errors::Result;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cooperative cancellation flag shared with one activity.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, cvar) = &*self.inner;
        *lock(flag) = true;
        cvar.notify_all();
    }

    /// Wait for `duration` or until cancelled. Returns `false` if cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let deadline = Instant::now() + duration;
        let mut cancelled = lock(flag);
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            cancelled = match cvar.wait_timeout(cancelled, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        false
    }
}

struct Activity {
    name: &'static str,
    token: CancelToken,
    handle: JoinHandle<()>,
}

/// Runs at most one background activity at a time.
pub struct Worker {
    name: String,
    current: Mutex<Option<Activity>>,
}

impl Worker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            current: Mutex::new(None),
        }
    }

    /// Cancel the running activity (if any), wait for it, then start `task`.
    pub fn spawn<F>(&self, activity: &'static str, task: F) -> Result<()>
    where
        F: FnOnce(CancelToken) + Send + 'static,
    {
        let mut current = lock(&self.current);
        if let Some(previous) = current.take() {
            Self::finish(previous);
        }

        let token = CancelToken::new();
        let task_token = token.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-{}", self.name, activity))
            .spawn(move || task(task_token))?;
        debug!("{}: started {}", self.name, activity);

        *current = Some(Activity {
            name: activity,
            token,
            handle,
        });
        Ok(())
    }

    /// Cancel the running activity and wait for it to exit.
    pub fn cancel(&self) {
        let previous = lock(&self.current).take();
        if let Some(previous) = previous {
            Self::finish(previous);
        }
    }

    fn finish(activity: Activity) {
        activity.token.cancel();
        if activity.handle.join().is_err() {
            warn!("background activity '{}' panicked", activity.name);
        } else {
            debug!("background activity '{}' finished", activity.name);
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.cancel();
    }
}
