//! Fail-fast escalation of unrecoverable lifecycle failures.
//!
//! A fatal escalation logs the failure together with the serialized entry
//! that could not be recorded, then asks the injected [`ShutdownHook`] to stop
//! the process from a detached task so the caller still gets its error back.

use std::fmt;
use std::sync::Arc;

use crate::entry::LogEntry;
use crate::traits::ShutdownHook;

/// Hook used when none was wired at bootstrap: it can only complain.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnwiredShutdown;

impl ShutdownHook for UnwiredShutdown {
    fn stop(&self) {
        tracing::warn!("process stop requested but no shutdown hook is installed");
    }
}

/// Routes failures to the log and, when fatal, to the shutdown hook.
#[derive(Clone)]
pub struct Escalator {
    hook: Arc<dyn ShutdownHook>,
}

impl fmt::Debug for Escalator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Escalator").finish_non_exhaustive()
    }
}

impl Escalator {
    #[must_use]
    pub fn new(hook: Arc<dyn ShutdownHook>) -> Self {
        Self { hook }
    }

    /// Logs `error` as fatal and requests a process stop.
    pub fn fatal(&self, entry: &LogEntry, error: &(dyn std::error::Error + 'static)) {
        tracing::error!(
            fatal = true,
            entry_kind = entry.kind(),
            entry = %entry.to_json(),
            error = %error,
            "lifecycle event could not be recorded, stopping process"
        );
        self.request_stop();
    }

    /// Escalates according to `stop_app`: fatal when true, a plain error log
    /// when false.
    pub fn escalate(
        &self,
        entry: &LogEntry,
        error: &(dyn std::error::Error + 'static),
        stop_app: bool,
    ) {
        if stop_app {
            self.fatal(entry, error);
        } else {
            tracing::error!(
                fatal = false,
                entry_kind = entry.kind(),
                entry = %entry.to_json(),
                error = %error,
                "lifecycle completion failed, continuing"
            );
        }
    }

    /// Invokes the shutdown hook without blocking the caller.
    pub fn request_stop(&self) {
        let hook = Arc::clone(&self.hook);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { hook.stop() });
            }
            Err(_) => {
                std::thread::spawn(move || hook.stop());
            }
        }
    }
}

impl Default for Escalator {
    fn default() -> Self {
        Self::new(Arc::new(UnwiredShutdown))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::Notify;

    use super::*;
    use crate::entry::{CallEntry, Correlation};

    #[derive(Default)]
    struct CountingHook {
        stops: AtomicUsize,
        stopped: Notify,
    }

    impl ShutdownHook for CountingHook {
        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.stopped.notify_one();
        }
    }

    fn call_entry() -> LogEntry {
        LogEntry::Call(CallEntry {
            correlation: Correlation::default(),
            service: "kafka".to_string(),
            method: "produce".to_string(),
            elapsed_ms: 1,
            succeeded: false,
        })
    }

    #[tokio::test]
    async fn fatal_requests_stop_asynchronously() {
        let hook = Arc::new(CountingHook::default());
        let escalator = Escalator::new(hook.clone());

        let error = std::io::Error::other("broker unreachable");
        escalator.fatal(&call_entry(), &error);

        tokio::time::timeout(Duration::from_secs(1), hook.stopped.notified())
            .await
            .unwrap();
        assert_eq!(hook.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_fatal_escalation_does_not_stop() {
        let hook = Arc::new(CountingHook::default());
        let escalator = Escalator::new(hook.clone());

        let error = std::io::Error::other("late ack");
        escalator.escalate(&call_entry(), &error, false);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hook.stops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn request_stop_outside_runtime_uses_thread() {
        let hook = Arc::new(CountingHook::default());
        let escalator = Escalator::new(hook.clone());
        escalator.request_stop();

        for _ in 0..100 {
            if hook.stops.load(Ordering::SeqCst) == 1 {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("shutdown hook was not invoked");
    }
}
