//! Shared "keep running" flag.
//!
//! Every loop checks the flag at the top of each iteration. Waits that must
//! observe a stop request (reconnect delay, file pacing) go through
//! [`ShutdownSignal::wait`], which returns as soon as the signal fires.
//! Calls that block outside this module (a pipe write to a stalled child)
//! register a hook with [`ShutdownSignal::on_trigger`] that unblocks them.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

type Hook = Box<dyn Fn() + Send>;

/// Registration returned by [`ShutdownSignal::on_trigger`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HookId(u64);

#[derive(Clone, Debug, Default)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    triggered: AtomicBool,
    lock: Mutex<()>,
    cvar: Condvar,
    hooks: Mutex<Hooks>,
}

#[derive(Default)]
struct Hooks {
    next_id: u64,
    entries: Vec<(u64, Hook)>,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inner")
            .field("triggered", &self.triggered)
            .finish_non_exhaustive()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Wakes every thread blocked in [`ShutdownSignal::wait`]
    /// and runs the registered hooks once.
    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::SeqCst);
        {
            let _guard = self.inner.lock.lock();
            self.inner.cvar.notify_all();
        }
        let hooks = std::mem::take(&mut self.hooks().entries);
        for (_, hook) in hooks {
            hook();
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        !self.is_triggered()
    }

    /// Run `hook` when shutdown is triggered. If it already was, the hook runs
    /// immediately and `None` is returned.
    pub fn on_trigger(&self, hook: impl Fn() + Send + 'static) -> Option<HookId> {
        let mut hooks = self.hooks();
        if self.is_triggered() {
            drop(hooks);
            hook();
            return None;
        }
        let id = hooks.next_id;
        hooks.next_id += 1;
        hooks.entries.push((id, Box::new(hook)));
        Some(HookId(id))
    }

    /// Drop a hook that is no longer needed.
    pub fn remove_hook(&self, id: HookId) {
        self.hooks().entries.retain(|(entry, _)| *entry != id.0);
    }

    /// Sleep for `timeout` unless shutdown is requested first.
    ///
    /// Returns `true` when the wait ended because of shutdown.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let Ok(mut guard) = self.inner.lock.lock() else {
            return self.is_triggered();
        };
        loop {
            if self.is_triggered() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = match self.inner.cvar.wait_timeout(guard, deadline - now) {
                Ok((guard, _)) => guard,
                Err(_) => return self.is_triggered(),
            };
        }
    }

    fn hooks(&self) -> MutexGuard<'_, Hooks> {
        match self.inner.hooks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
