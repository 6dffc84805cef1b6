//! The topology recorder
//!
//! An append-only record of everything the client declared: exchanges,
//! queues, bindings and consumers. Deletions and unbinds remove entries,
//! auto-delete pruning mirrors the broker's own behaviour so that recovery
//! never re-declares what the broker removed server-side, and renames
//! rewrite every dependent entry when the broker assigns a new identity
//! during recovery.
//!
//! One mutex guards all four collections because prune cascades cross
//! them. Insertion order is preserved per kind; replay walks exchanges,
//! queues, bindings and consumers in that order so dependencies resolve.

use std::fmt;
use std::sync::Weak;

use indexmap::IndexMap;
use parking_lot::Mutex;
use siderite_amqp_types::primitives::FieldTable;

use crate::dispatch::DeliveryCallback;
use crate::recovery::RecoveringChannelInner;

/// Exchanges that exist on every broker and are never recorded: the
/// default exchange and the `amq.*` family
pub(crate) fn is_predeclared(exchange: &str) -> bool {
    exchange.is_empty() || exchange.starts_with("amq.")
}

/// A recorded exchange declaration
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedExchange {
    /// Exchange name
    pub name: String,
    /// Exchange type
    pub kind: String,
    /// Survives broker restarts
    pub durable: bool,
    /// Deleted by the broker when its last binding is removed
    pub auto_delete: bool,
    /// Not directly publishable by clients
    pub internal: bool,
    /// Extension arguments
    pub arguments: FieldTable,
}

/// A recorded queue declaration
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedQueue {
    /// Current queue name; rewritten when recovery renames a server-named
    /// queue
    pub name: String,
    /// Survives broker restarts
    pub durable: bool,
    /// Only accessible on the declaring connection
    pub exclusive: bool,
    /// Deleted by the broker when its last consumer cancels
    pub auto_delete: bool,
    /// Declared with an empty name, so the broker assigned the name
    pub server_named: bool,
    /// Extension arguments
    pub arguments: FieldTable,
}

/// The destination side of a recorded binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingDestination {
    /// Exchange-to-queue binding
    Queue(String),
    /// Exchange-to-exchange binding
    Exchange(String),
}

/// A recorded binding; its identity is all four fields
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedBinding {
    /// Source exchange
    pub source: String,
    /// Destination queue or exchange
    pub destination: BindingDestination,
    /// Routing key
    pub routing_key: String,
    /// Extension arguments
    pub arguments: FieldTable,
}

/// A recorded consumer subscription
#[derive(Clone)]
pub struct RecordedConsumer {
    /// Current consumer tag; rewritten when recovery is handed a new tag
    pub consumer_tag: String,
    /// Queue consumed from; rewritten when the queue is renamed
    pub queue: String,
    /// Deliveries need no acknowledgement
    pub no_ack: bool,
    /// Exclusive consumer access
    pub exclusive: bool,
    /// Extension arguments
    pub arguments: FieldTable,
    pub(crate) channel: Weak<RecoveringChannelInner>,
    pub(crate) callback: DeliveryCallback,
}

impl fmt::Debug for RecordedConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordedConsumer")
            .field("consumer_tag", &self.consumer_tag)
            .field("queue", &self.queue)
            .field("no_ack", &self.no_ack)
            .field("exclusive", &self.exclusive)
            .finish()
    }
}

#[derive(Default)]
struct Inner {
    exchanges: IndexMap<String, RecordedExchange>,
    queues: IndexMap<String, RecordedQueue>,
    bindings: Vec<RecordedBinding>,
    consumers: IndexMap<String, RecordedConsumer>,
}

impl Inner {
    fn delete_exchange(&mut self, name: &str) {
        self.exchanges.shift_remove(name);
        let removed = self.remove_bindings(|binding| {
            binding.source == name
                || matches!(&binding.destination, BindingDestination::Exchange(e) if e == name)
        });
        for binding in &removed {
            self.prune_binding_endpoints(binding);
        }
    }

    fn delete_queue(&mut self, name: &str) {
        self.queues.shift_remove(name);
        self.consumers.retain(|_, consumer| consumer.queue != name);
        let removed = self.remove_bindings(
            |binding| matches!(&binding.destination, BindingDestination::Queue(q) if q == name),
        );
        for binding in &removed {
            self.prune_binding_endpoints(binding);
        }
    }

    fn remove_bindings(
        &mut self,
        mut predicate: impl FnMut(&RecordedBinding) -> bool,
    ) -> Vec<RecordedBinding> {
        let mut removed = Vec::new();
        self.bindings.retain(|binding| {
            if predicate(binding) {
                removed.push(binding.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    fn prune_binding_endpoints(&mut self, binding: &RecordedBinding) {
        self.maybe_prune_exchange(&binding.source);
        match &binding.destination {
            BindingDestination::Queue(queue) => self.maybe_prune_queue(queue),
            BindingDestination::Exchange(exchange) => self.maybe_prune_exchange(exchange),
        }
    }

    /// An auto-delete exchange goes once nothing is bound at or to it
    fn maybe_prune_exchange(&mut self, name: &str) {
        let auto_delete = match self.exchanges.get(name) {
            Some(exchange) => exchange.auto_delete,
            None => return,
        };
        if !auto_delete {
            return;
        }
        let referenced = self.bindings.iter().any(|binding| {
            binding.source == name
                || matches!(&binding.destination, BindingDestination::Exchange(e) if e == name)
        });
        if !referenced {
            self.delete_exchange(name);
        }
    }

    /// An auto-delete queue goes once it has no consumers and no bindings
    fn maybe_prune_queue(&mut self, name: &str) {
        let auto_delete = match self.queues.get(name) {
            Some(queue) => queue.auto_delete,
            None => return,
        };
        if !auto_delete {
            return;
        }
        let has_consumers = self.consumers.values().any(|consumer| consumer.queue == name);
        let has_bindings = self
            .bindings
            .iter()
            .any(|binding| matches!(&binding.destination, BindingDestination::Queue(q) if q == name));
        if !has_consumers && !has_bindings {
            self.delete_queue(name);
        }
    }
}

/// The recorder of declared topology, consulted by the recovery
/// orchestrator to rebuild server state after a reconnect
pub struct TopologyRecorder {
    inner: Mutex<Inner>,
}

impl fmt::Debug for TopologyRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TopologyRecorder")
            .field("exchanges", &inner.exchanges.len())
            .field("queues", &inner.queues.len())
            .field("bindings", &inner.bindings.len())
            .field("consumers", &inner.consumers.len())
            .finish()
    }
}

impl Default for TopologyRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyRecorder {
    /// Creates an empty recorder
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Record an exchange declaration; re-declaring replaces the entry
    pub fn record_exchange(&self, exchange: RecordedExchange) {
        if is_predeclared(&exchange.name) {
            return;
        }
        self.inner.lock().exchanges.insert(exchange.name.clone(), exchange);
    }

    /// Remove an exchange and every binding referring to it
    pub fn delete_exchange(&self, name: &str) {
        self.inner.lock().delete_exchange(name);
    }

    /// Record a queue declaration; re-declaring replaces the entry
    pub fn record_queue(&self, queue: RecordedQueue) {
        self.inner.lock().queues.insert(queue.name.clone(), queue);
    }

    /// Remove a queue together with its bindings and consumers
    pub fn delete_queue(&self, name: &str) {
        self.inner.lock().delete_queue(name);
    }

    /// Record a binding; identical bindings collapse into one entry
    pub fn record_binding(&self, binding: RecordedBinding) {
        let mut inner = self.inner.lock();
        if !inner.bindings.contains(&binding) {
            inner.bindings.push(binding);
        }
    }

    /// Remove a binding by its four-field identity and prune auto-delete
    /// endpoints it was keeping alive
    pub fn delete_binding(&self, binding: &RecordedBinding) {
        let mut inner = self.inner.lock();
        let before = inner.bindings.len();
        inner.bindings.retain(|recorded| recorded != binding);
        if inner.bindings.len() != before {
            inner.prune_binding_endpoints(binding);
        }
    }

    pub(crate) fn record_consumer(&self, consumer: RecordedConsumer) {
        self.inner
            .lock()
            .consumers
            .insert(consumer.consumer_tag.clone(), consumer);
    }

    /// Remove a consumer and prune its auto-delete queue if it was the
    /// last thing keeping it alive
    pub fn delete_consumer(&self, consumer_tag: &str) {
        let mut inner = self.inner.lock();
        let Some(consumer) = inner.consumers.shift_remove(consumer_tag) else {
            return;
        };
        inner.maybe_prune_queue(&consumer.queue);
    }

    /// Rewrite a queue name and every binding and consumer referring to it
    ///
    /// Used during recovery, after the broker assigned a fresh name to a
    /// server-named queue and before the dependent binds and consumes are
    /// replayed.
    pub fn rename_queue(&self, old: &str, new: &str) {
        let mut inner = self.inner.lock();
        if let Some(mut queue) = inner.queues.shift_remove(old) {
            queue.name = new.to_string();
            inner.queues.insert(new.to_string(), queue);
        }
        for binding in &mut inner.bindings {
            if matches!(&binding.destination, BindingDestination::Queue(q) if q == old) {
                binding.destination = BindingDestination::Queue(new.to_string());
            }
        }
        for consumer in inner.consumers.values_mut() {
            if consumer.queue == old {
                consumer.queue = new.to_string();
            }
        }
    }

    /// Remove every consumer recorded by one recovering channel, pruning
    /// auto-delete queues they were keeping alive
    pub(crate) fn purge_channel_consumers(&self, channel: &Weak<RecoveringChannelInner>) {
        let tags: Vec<String> = {
            let inner = self.inner.lock();
            inner
                .consumers
                .values()
                .filter(|consumer| Weak::ptr_eq(&consumer.channel, channel))
                .map(|consumer| consumer.consumer_tag.clone())
                .collect()
        };
        for tag in tags {
            self.delete_consumer(&tag);
        }
    }

    /// Rewrite a consumer tag after the broker assigned a fresh one
    pub fn rename_consumer(&self, old: &str, new: &str) {
        let mut inner = self.inner.lock();
        if let Some(mut consumer) = inner.consumers.shift_remove(old) {
            consumer.consumer_tag = new.to_string();
            inner.consumers.insert(new.to_string(), consumer);
        }
    }

    /// Forget everything; used when topology recovery is configured off
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        *inner = Inner::default();
    }

    /// Number of recorded exchanges
    pub fn exchange_count(&self) -> usize {
        self.inner.lock().exchanges.len()
    }

    /// Number of recorded queues
    pub fn queue_count(&self) -> usize {
        self.inner.lock().queues.len()
    }

    /// Number of recorded bindings
    pub fn binding_count(&self) -> usize {
        self.inner.lock().bindings.len()
    }

    /// Number of recorded consumers
    pub fn consumer_count(&self) -> usize {
        self.inner.lock().consumers.len()
    }

    /// Number of recorded consumers on one queue
    pub fn consumer_count_on(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .consumers
            .values()
            .filter(|consumer| consumer.queue == queue)
            .count()
    }

    /// The recorded queue under this name, if any
    pub fn recorded_queue(&self, name: &str) -> Option<RecordedQueue> {
        self.inner.lock().queues.get(name).cloned()
    }

    pub(crate) fn snapshot_exchanges(&self) -> Vec<RecordedExchange> {
        self.inner.lock().exchanges.values().cloned().collect()
    }

    pub(crate) fn snapshot_queues(&self) -> Vec<RecordedQueue> {
        self.inner.lock().queues.values().cloned().collect()
    }

    pub(crate) fn snapshot_bindings(&self) -> Vec<RecordedBinding> {
        self.inner.lock().bindings.clone()
    }

    pub(crate) fn snapshot_consumers(&self) -> Vec<RecordedConsumer> {
        self.inner.lock().consumers.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn exchange(name: &str, auto_delete: bool) -> RecordedExchange {
        RecordedExchange {
            name: name.to_string(),
            kind: "fanout".to_string(),
            durable: false,
            auto_delete,
            internal: false,
            arguments: FieldTable::new(),
        }
    }

    fn queue(name: &str, auto_delete: bool) -> RecordedQueue {
        RecordedQueue {
            name: name.to_string(),
            durable: false,
            exclusive: false,
            auto_delete,
            server_named: false,
            arguments: FieldTable::new(),
        }
    }

    fn binding(source: &str, queue: &str, key: &str) -> RecordedBinding {
        RecordedBinding {
            source: source.to_string(),
            destination: BindingDestination::Queue(queue.to_string()),
            routing_key: key.to_string(),
            arguments: FieldTable::new(),
        }
    }

    fn consumer(tag: &str, queue: &str) -> RecordedConsumer {
        RecordedConsumer {
            consumer_tag: tag.to_string(),
            queue: queue.to_string(),
            no_ack: false,
            exclusive: false,
            arguments: FieldTable::new(),
            channel: Weak::new(),
            callback: Arc::new(|_| {}),
        }
    }

    #[test]
    fn declare_then_delete_restores_the_counts() {
        let recorder = TopologyRecorder::new();
        recorder.record_exchange(exchange("logs", false));
        recorder.record_queue(queue("inbox", false));
        assert_eq!(recorder.exchange_count(), 1);
        assert_eq!(recorder.queue_count(), 1);

        recorder.delete_exchange("logs");
        recorder.delete_queue("inbox");
        assert_eq!(recorder.exchange_count(), 0);
        assert_eq!(recorder.queue_count(), 0);
    }

    #[test]
    fn predeclared_exchanges_are_never_recorded() {
        let recorder = TopologyRecorder::new();
        recorder.record_exchange(exchange("", false));
        recorder.record_exchange(exchange("amq.fanout", false));
        assert_eq!(recorder.exchange_count(), 0);

        // bindings to them are still recorded; the endpoints pre-exist
        recorder.record_queue(queue("inbox", false));
        recorder.record_binding(binding("amq.fanout", "inbox", ""));
        assert_eq!(recorder.binding_count(), 1);
    }

    #[test]
    fn identical_bindings_collapse() {
        let recorder = TopologyRecorder::new();
        recorder.record_binding(binding("logs", "inbox", "a"));
        recorder.record_binding(binding("logs", "inbox", "a"));
        recorder.record_binding(binding("logs", "inbox", "b"));
        assert_eq!(recorder.binding_count(), 2);
    }

    #[test]
    fn auto_delete_queue_is_pruned_with_its_last_consumer() {
        let recorder = TopologyRecorder::new();
        recorder.record_queue(queue("transient", true));
        recorder.record_consumer(consumer("ctag-1", "transient"));
        recorder.record_consumer(consumer("ctag-2", "transient"));

        recorder.delete_consumer("ctag-1");
        assert_eq!(recorder.queue_count(), 1);
        recorder.delete_consumer("ctag-2");
        assert_eq!(recorder.queue_count(), 0);
    }

    #[test]
    fn auto_delete_exchange_is_pruned_with_its_last_binding() {
        let recorder = TopologyRecorder::new();
        recorder.record_exchange(exchange("events", true));
        recorder.record_queue(queue("inbox", false));
        let b = binding("events", "inbox", "");
        recorder.record_binding(b.clone());

        recorder.delete_binding(&b);
        assert_eq!(recorder.exchange_count(), 0);
        assert_eq!(recorder.queue_count(), 1);
    }

    #[test]
    fn pruning_cascades_recursively() {
        // auto-delete exchange -> auto-delete queue held alive only by a
        // consumer; removing the consumer takes everything with it
        let recorder = TopologyRecorder::new();
        recorder.record_exchange(exchange("events", true));
        recorder.record_queue(queue("transient", true));
        recorder.record_binding(binding("events", "transient", ""));
        recorder.record_consumer(consumer("ctag-1", "transient"));

        recorder.delete_consumer("ctag-1");
        assert_eq!(recorder.queue_count(), 0);
        assert_eq!(recorder.binding_count(), 0);
        assert_eq!(recorder.exchange_count(), 0);
    }

    #[test]
    fn deleting_a_queue_cascades_to_bindings_and_consumers() {
        let recorder = TopologyRecorder::new();
        recorder.record_exchange(exchange("logs", false));
        recorder.record_queue(queue("inbox", false));
        recorder.record_binding(binding("logs", "inbox", ""));
        recorder.record_consumer(consumer("ctag-1", "inbox"));

        recorder.delete_queue("inbox");
        assert_eq!(recorder.binding_count(), 0);
        assert_eq!(recorder.consumer_count(), 0);
        assert_eq!(recorder.exchange_count(), 1);
    }

    #[test]
    fn renaming_a_queue_rewrites_bindings_and_consumers() {
        let recorder = TopologyRecorder::new();
        let mut q = queue("amq.gen-old", true);
        q.server_named = true;
        recorder.record_queue(q);
        recorder.record_binding(binding("amq.fanout", "amq.gen-old", ""));
        recorder.record_consumer(consumer("ctag-1", "amq.gen-old"));

        recorder.rename_queue("amq.gen-old", "amq.gen-new");

        assert!(recorder.recorded_queue("amq.gen-old").is_none());
        let renamed = recorder.recorded_queue("amq.gen-new").unwrap();
        assert!(renamed.server_named);
        let bindings = recorder.snapshot_bindings();
        assert_eq!(
            bindings[0].destination,
            BindingDestination::Queue("amq.gen-new".to_string())
        );
        assert_eq!(recorder.consumer_count_on("amq.gen-new"), 1);
        assert_eq!(recorder.consumer_count_on("amq.gen-old"), 0);
    }

    #[test]
    fn renaming_a_consumer_rekeys_it() {
        let recorder = TopologyRecorder::new();
        recorder.record_consumer(consumer("ctag-old", "inbox"));
        recorder.rename_consumer("ctag-old", "ctag-new");
        let consumers = recorder.snapshot_consumers();
        assert_eq!(consumers.len(), 1);
        assert_eq!(consumers[0].consumer_tag, "ctag-new");
    }

    /// Pruning invariant over randomized operation sequences: once no
    /// consumer and no binding refers to an auto-delete entity, none of
    /// that kind remain recorded.
    #[test]
    fn random_sequences_never_leak_auto_delete_entities() {
        // deterministic LCG so failures reproduce
        let mut state = 0x2545F491_4F6CDD1Du64;
        let mut next = move |bound: u64| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) % bound
        };

        for _ in 0..1000 {
            let recorder = TopologyRecorder::new();
            let mut live_bindings: Vec<RecordedBinding> = Vec::new();
            let mut live_consumers: Vec<String> = Vec::new();
            let mut serial = 0u64;

            for _ in 0..next(40) + 5 {
                match next(6) {
                    0 => recorder.record_exchange(exchange(&format!("x{}", next(4)), true)),
                    1 => recorder.record_queue(queue(&format!("q{}", next(4)), true)),
                    2 => {
                        let b = binding(
                            &format!("x{}", next(4)),
                            &format!("q{}", next(4)),
                            "k",
                        );
                        recorder.record_binding(b.clone());
                        if !live_bindings.contains(&b) {
                            live_bindings.push(b);
                        }
                    }
                    3 => {
                        serial += 1;
                        let tag = format!("ctag-{serial}");
                        recorder.record_consumer(consumer(&tag, &format!("q{}", next(4))));
                        live_consumers.push(tag);
                    }
                    4 => {
                        if !live_bindings.is_empty() {
                            let b = live_bindings.remove(next(live_bindings.len() as u64) as usize);
                            recorder.delete_binding(&b);
                        }
                    }
                    _ => {
                        if !live_consumers.is_empty() {
                            let tag =
                                live_consumers.remove(next(live_consumers.len() as u64) as usize);
                            recorder.delete_consumer(&tag);
                        }
                    }
                }
            }

            // drain the remaining references
            for tag in live_consumers.drain(..) {
                recorder.delete_consumer(&tag);
            }
            for b in live_bindings.drain(..) {
                recorder.delete_binding(&b);
            }

            // deleting a binding may have been recorded as a duplicate and
            // already removed; sweep whatever the recorder still holds
            for b in recorder.snapshot_bindings() {
                recorder.delete_binding(&b);
            }

            // an auto-delete entity is pruned when its last referrer is
            // removed; give every survivor one referrer and remove it,
            // mirroring the broker's last-consumer / last-binding rule
            for q in recorder.snapshot_queues() {
                if q.auto_delete {
                    recorder.record_consumer(consumer("sweep", &q.name));
                    recorder.delete_consumer("sweep");
                }
            }
            for x in recorder.snapshot_exchanges() {
                if x.auto_delete {
                    let b = binding(&x.name, "sweep-q", "k");
                    recorder.record_binding(b.clone());
                    recorder.delete_binding(&b);
                }
            }

            assert_eq!(recorder.binding_count(), 0);
            assert_eq!(recorder.consumer_count(), 0);
            for queue in recorder.snapshot_queues() {
                assert!(!queue.auto_delete, "auto-delete queue {} leaked", queue.name);
            }
            for exchange in recorder.snapshot_exchanges() {
                assert!(
                    !exchange.auto_delete,
                    "auto-delete exchange {} leaked",
                    exchange.name
                );
            }
        }
    }
}
