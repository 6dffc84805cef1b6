//! Shutdown reasons and the close-reason latch

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// Which side initiated a shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownInitiator {
    /// The application called close
    Application,

    /// The library shut the object down, e.g. on an IO error or a protocol
    /// violation it detected
    Library,

    /// The peer sent a close method
    Peer,
}

/// Why a connection or channel was shut down
///
/// Immutable once set; shared behind an [`Arc`] by everything that observed
/// the shutdown.
#[derive(Debug)]
pub struct ShutdownReason {
    /// Which side initiated the shutdown
    pub initiator: ShutdownInitiator,

    /// AMQP reply code, zero when no method was involved
    pub reply_code: u16,

    /// Human-readable reply text
    pub reply_text: String,

    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ShutdownReason {
    /// A shutdown initiated by the application
    pub fn application(reply_code: u16, reply_text: impl Into<String>) -> Self {
        Self {
            initiator: ShutdownInitiator::Application,
            reply_code,
            reply_text: reply_text.into(),
            cause: None,
        }
    }

    /// A shutdown initiated by the library
    pub fn library(reply_code: u16, reply_text: impl Into<String>) -> Self {
        Self {
            initiator: ShutdownInitiator::Library,
            reply_code,
            reply_text: reply_text.into(),
            cause: None,
        }
    }

    /// A shutdown caused by a close method from the peer
    pub fn peer(reply_code: u16, reply_text: impl Into<String>) -> Self {
        Self {
            initiator: ShutdownInitiator::Peer,
            reply_code,
            reply_text: reply_text.into(),
            cause: None,
        }
    }

    /// The socket closed or the peer went silent past the heartbeat grace
    pub fn end_of_stream() -> Self {
        Self::library(0, "End of stream")
    }

    /// Attach the underlying error that caused this shutdown
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// The underlying error, when the shutdown was caused by one
    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync)> {
        self.cause.as_deref()
    }

    /// A copy carrying the same initiator, code and text but not the cause
    pub(crate) fn replicate(&self) -> Self {
        Self {
            initiator: self.initiator,
            reply_code: self.reply_code,
            reply_text: self.reply_text.clone(),
            cause: None,
        }
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} initiated shutdown, code={}, text={:?}",
            self.initiator, self.reply_code, self.reply_text
        )?;
        if let Some(cause) = &self.cause {
            write!(f, ", cause: {cause}")?;
        }
        Ok(())
    }
}

type Handler = Box<dyn FnOnce(Arc<ShutdownReason>) + Send>;

enum State {
    Open(Vec<Handler>),
    Latched(Arc<ShutdownReason>, Vec<Handler>),
    Notified(Arc<ShutdownReason>),
}

/// The monotonic close-reason latch with its observer list
///
/// The reason is set exactly once; multiple shutdown paths (graceful close,
/// abort, heartbeat starvation, peer close) race for the latch and only the
/// winner runs the observers. A handler subscribed after notification runs
/// synchronously with the existing reason.
pub(crate) struct ShutdownNotifier {
    state: Mutex<State>,
}

impl ShutdownNotifier {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Open(Vec::new())),
        }
    }

    /// The latched reason, if any
    pub fn reason(&self) -> Option<Arc<ShutdownReason>> {
        match &*self.state.lock() {
            State::Open(_) => None,
            State::Latched(reason, _) | State::Notified(reason) => Some(reason.clone()),
        }
    }

    pub fn is_latched(&self) -> bool {
        !matches!(&*self.state.lock(), State::Open(_))
    }

    /// Latch the reason; returns false when another path won the race
    pub fn latch(&self, reason: ShutdownReason) -> bool {
        let mut state = self.state.lock();
        match &mut *state {
            State::Open(handlers) => {
                let handlers = std::mem::take(handlers);
                *state = State::Latched(Arc::new(reason), handlers);
                true
            }
            _ => false,
        }
    }

    /// Run the observers exactly once with the latched reason
    ///
    /// Handlers run outside the lock so that they may subscribe further
    /// handlers without deadlocking.
    pub fn notify(&self) {
        let (reason, handlers) = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, State::Open(Vec::new())) {
                State::Latched(reason, handlers) => {
                    *state = State::Notified(reason.clone());
                    (reason, handlers)
                }
                other => {
                    *state = other;
                    return;
                }
            }
        };
        for handler in handlers {
            handler(reason.clone());
        }
    }

    /// Latch and notify in one step; returns false when already latched
    pub fn latch_and_notify(&self, reason: ShutdownReason) -> bool {
        let latched = self.latch(reason);
        if latched {
            self.notify();
        }
        latched
    }

    /// Subscribe an observer
    ///
    /// Cold subscription: when the shutdown has already been notified, the
    /// handler is invoked synchronously with the existing reason.
    pub fn on_shutdown(&self, handler: impl FnOnce(Arc<ShutdownReason>) + Send + 'static) {
        let reason = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Open(handlers) | State::Latched(_, handlers) => {
                    handlers.push(Box::new(handler));
                    return;
                }
                State::Notified(reason) => reason.clone(),
            }
        };
        handler(reason);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn latch_is_monotonic() {
        let notifier = ShutdownNotifier::new();
        assert!(notifier.latch(ShutdownReason::application(200, "Goodbye")));
        assert!(!notifier.latch(ShutdownReason::end_of_stream()));
        assert_eq!(notifier.reason().unwrap().reply_code, 200);
    }

    #[test]
    fn handlers_run_exactly_once() {
        let notifier = ShutdownNotifier::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let seen = calls.clone();
        notifier.on_shutdown(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        notifier.latch_and_notify(ShutdownReason::end_of_stream());
        notifier.notify();
        notifier.notify();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cold_subscription_fires_synchronously() {
        let notifier = ShutdownNotifier::new();
        notifier.latch_and_notify(ShutdownReason::peer(320, "CONNECTION_FORCED"));

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        notifier.on_shutdown(move |reason| {
            assert_eq!(reason.reply_code, 320);
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_subscribed_while_latched_runs_on_notify() {
        let notifier = ShutdownNotifier::new();
        assert!(notifier.latch(ShutdownReason::end_of_stream()));

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        notifier.on_shutdown(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        notifier.notify();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
