//! Consumer delivery dispatch
//!
//! Deliveries are handed to user callbacks off the engine task: one ordered
//! worker per channel preserves broker order within the channel, while a
//! connection-wide semaphore bounds how many callbacks run concurrently
//! across channels. Callback panics are caught and routed to the
//! callback-exception observers; they never unwind into the engine.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tracing::error;

use crate::channel::Delivery;

/// A user callback invoked once per delivery
pub(crate) type DeliveryCallback = Arc<dyn Fn(Delivery) + Send + Sync + 'static>;

/// Observers for exceptions escaping user callbacks
#[derive(Clone)]
pub(crate) struct CallbackExceptionSink {
    handlers: Arc<Mutex<Vec<Box<dyn Fn(&str) + Send + Sync>>>>,
}

impl CallbackExceptionSink {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn subscribe(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        self.handlers.lock().push(Box::new(handler));
    }

    pub fn notify(&self, context: &str) {
        error!(context, "callback raised");
        for handler in self.handlers.lock().iter() {
            handler(context);
        }
    }
}

/// Per-connection delivery work service
pub(crate) struct WorkService {
    permits: Arc<Semaphore>,
    exceptions: CallbackExceptionSink,
}

impl WorkService {
    pub fn new(concurrency: usize, exceptions: CallbackExceptionSink) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            exceptions,
        }
    }

    /// Spawn the ordered worker for one channel
    pub fn start_worker(&self) -> ChannelWorker {
        let (tx, mut rx) = mpsc::unbounded_channel::<WorkItem>();
        let permits = self.permits.clone();
        let exceptions = self.exceptions.clone();

        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                // Semaphore::close is never called, acquire cannot fail
                let Ok(_permit) = permits.acquire().await else {
                    break;
                };
                let outcome = catch_unwind(AssertUnwindSafe(|| (item.callback)(item.delivery)));
                if outcome.is_err() {
                    exceptions.notify("consumer delivery callback panicked");
                }
            }
        });

        ChannelWorker { queue: tx }
    }
}

/// Sender half of one channel's delivery queue; dropping it stops the worker
pub(crate) struct ChannelWorker {
    queue: mpsc::UnboundedSender<WorkItem>,
}

impl ChannelWorker {
    pub fn dispatch(&self, callback: DeliveryCallback, delivery: Delivery) {
        // A send error means the worker stopped because the connection is
        // going down; the delivery is dropped with it.
        let _ = self.queue.send(WorkItem { callback, delivery });
    }
}

struct WorkItem {
    callback: DeliveryCallback,
    delivery: Delivery,
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use siderite_amqp_types::BasicProperties;

    use super::*;

    fn delivery(tag: u64) -> Delivery {
        Delivery {
            consumer_tag: "ctag".into(),
            delivery_tag: tag,
            redelivered: false,
            exchange: String::new(),
            routing_key: "k".into(),
            properties: BasicProperties::default(),
            body: bytes::Bytes::from_static(b"payload"),
        }
    }

    #[tokio::test]
    async fn deliveries_on_one_channel_stay_ordered() {
        let service = WorkService::new(4, CallbackExceptionSink::new());
        let worker = service.start_worker();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: DeliveryCallback =
            Arc::new(move |delivery| sink.lock().push(delivery.delivery_tag));

        for tag in 0..64u64 {
            worker.dispatch(callback.clone(), delivery(tag));
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if seen.lock().len() == 64 {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let seen = seen.lock();
        assert_eq!(&*seen, &(0..64u64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn panicking_callback_reaches_exception_observers_and_worker_survives() {
        let sink = CallbackExceptionSink::new();
        let panics = Arc::new(AtomicUsize::new(0));
        let seen = panics.clone();
        sink.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let service = WorkService::new(1, sink);
        let worker = service.start_worker();

        let delivered = Arc::new(AtomicUsize::new(0));
        let panicking: DeliveryCallback = Arc::new(|_| panic!("boom"));
        let counting = {
            let delivered = delivered.clone();
            Arc::new(move |_| {
                delivered.fetch_add(1, Ordering::SeqCst);
            }) as DeliveryCallback
        };

        worker.dispatch(panicking, delivery(1));
        worker.dispatch(counting, delivery(2));

        tokio::time::timeout(Duration::from_secs(5), async {
            while delivered.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(panics.load(Ordering::SeqCst), 1);
    }
}
