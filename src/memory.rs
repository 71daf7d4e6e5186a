// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Process Broker
//!
//! A [`BrokerGateway`] that keeps every queue in memory. It routes with the same
//! [`crate::routing`] engine as the publisher, so it makes the same routing
//! decisions a real broker would, and it enforces broker-side rules: FIFO per
//! queue, one settlement per delivery tag, requeue at the tail. Deliveries a
//! consumer still holds when its stream is dropped go back to their queue.

use crate::{
    errors::GatewayError,
    exchange::ExchangeDefinition,
    gateway::{BrokerGateway, DeliveryStream},
    message::{Delivery, Message},
    queue::{QueueBinding, QueueDefinition},
    topology::TopologyManager,
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tokio::sync::Notify;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    // completed deliveries so far
    attempts: u32,
}

#[derive(Debug, Default)]
struct MessageQueue {
    items: Mutex<VecDeque<Entry>>,
    notify: Notify,
}

impl MessageQueue {
    fn items(&self) -> MutexGuard<'_, VecDeque<Entry>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, entry: Entry) {
        self.items().push_back(entry);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Entry {
        loop {
            let next = self.items().pop_front();
            if let Some(entry) = next {
                return entry;
            }
            self.notify.notified().await;
        }
    }
}

struct InFlight {
    queue: Arc<MessageQueue>,
    entry: Entry,
    consumer: u64,
}

#[derive(Default)]
struct Inner {
    topology: Mutex<TopologyManager>,
    queues: Mutex<HashMap<String, Arc<MessageQueue>>>,
    in_flight: Mutex<HashMap<u64, InFlight>>,
    next_tag: AtomicU64,
    next_consumer: AtomicU64,
    unroutable: AtomicU64,
    settled: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owned by a delivery stream. Dropping it requeues whatever that stream
/// delivered and nobody settled.
struct Subscription {
    inner: Arc<Inner>,
    id: u64,
    consumer_tag: String,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut orphaned: Vec<(u64, InFlight)> = {
            let mut in_flight = lock(&self.inner.in_flight);
            let tags: Vec<u64> = in_flight
                .iter()
                .filter(|(_, f)| f.consumer == self.id)
                .map(|(tag, _)| *tag)
                .collect();
            tags.into_iter()
                .filter_map(|tag| in_flight.remove(&tag).map(|f| (tag, f)))
                .collect()
        };

        if orphaned.is_empty() {
            return;
        }

        warn!(
            consumer_tag = self.consumer_tag.as_str(),
            requeued = orphaned.len(),
            "consumer dropped with unsettled deliveries"
        );
        orphaned.sort_by_key(|(tag, _)| *tag);
        for (_, f) in orphaned {
            f.queue.push(f.entry);
        }
    }
}

/// In-process broker double. Cloning shares the same state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    pub fn new() -> InMemoryBroker {
        InMemoryBroker::default()
    }

    fn message_queue(&self, name: &str) -> Option<Arc<MessageQueue>> {
        lock(&self.inner.queues).get(name).cloned()
    }

    /// Number of messages waiting in a queue, not counting unsettled deliveries.
    pub fn depth(&self, queue: &str) -> usize {
        self.message_queue(queue)
            .map(|q| q.items().len())
            .unwrap_or_default()
    }

    /// Messages waiting in a queue, in delivery order.
    pub fn peek(&self, queue: &str) -> Vec<Message> {
        self.message_queue(queue)
            .map(|q| q.items().iter().map(|e| e.message.clone()).collect())
            .unwrap_or_default()
    }

    /// Messages published that matched no queue.
    pub fn unroutable_count(&self) -> u64 {
        self.inner.unroutable.load(Ordering::SeqCst)
    }

    /// Deliveries handed out and not yet settled.
    pub fn in_flight_count(&self) -> usize {
        lock(&self.inner.in_flight).len()
    }

    /// Acks and nacks accepted so far.
    pub fn settled_count(&self) -> u64 {
        self.inner.settled.load(Ordering::SeqCst)
    }

    fn settle(&self, delivery_tag: u64) -> Result<InFlight, GatewayError> {
        match lock(&self.inner.in_flight).remove(&delivery_tag) {
            Some(in_flight) => {
                self.inner.settled.fetch_add(1, Ordering::SeqCst);
                Ok(in_flight)
            }
            None => {
                warn!(delivery_tag, "settling unknown delivery tag");
                Err(GatewayError::UnknownDeliveryTag(delivery_tag))
            }
        }
    }
}

#[async_trait]
impl BrokerGateway for InMemoryBroker {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), GatewayError> {
        lock(&self.inner.topology)
            .declare_exchange(def.clone())
            .map_err(|err| GatewayError::PreconditionFailed(err.to_string()))
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), GatewayError> {
        lock(&self.inner.topology)
            .declare_queue(def.clone())
            .map_err(|err| GatewayError::PreconditionFailed(err.to_string()))?;

        lock(&self.inner.queues)
            .entry(def.name().to_owned())
            .or_default();
        Ok(())
    }

    async fn bind(&self, binding: &QueueBinding) -> Result<(), GatewayError> {
        lock(&self.inner.topology)
            .queue_binding(binding)
            .map_err(|err| GatewayError::PreconditionFailed(err.to_string()))
    }

    async fn publish(&self, exchange: &str, message: &Message) -> Result<(), GatewayError> {
        let matched = lock(&self.inner.topology)
            .topology()
            .route(exchange, message)
            .map_err(|_| GatewayError::PublishingError(exchange.to_owned()))?;

        if matched.is_empty() {
            debug!(exchange, key = message.effective_key(), "unroutable message dropped");
            self.inner.unroutable.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }

        for queue in matched {
            if let Some(q) = self.message_queue(&queue) {
                q.push(Entry {
                    message: message.clone(),
                    attempts: 0,
                });
            }
        }

        Ok(())
    }

    async fn send_to_queue(&self, queue: &str, message: &Message) -> Result<(), GatewayError> {
        let Some(mq) = self.message_queue(queue) else {
            return Err(GatewayError::UnknownQueue(queue.to_owned()));
        };

        mq.push(Entry {
            message: message.clone(),
            attempts: 0,
        });
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, GatewayError> {
        let Some(mq) = self.message_queue(queue) else {
            return Err(GatewayError::UnknownQueue(queue.to_owned()));
        };

        debug!(queue, consumer_tag, "consumer registered");

        let subscription = Subscription {
            inner: self.inner.clone(),
            id: self.inner.next_consumer.fetch_add(1, Ordering::SeqCst),
            consumer_tag: consumer_tag.to_owned(),
        };
        let state = (subscription, mq, queue.to_owned());
        let deliveries = stream::unfold(state, |(subscription, mq, queue)| async move {
            let mut entry = mq.pop().await;
            entry.attempts += 1;

            // a republished copy starts over at zero, its header remembers the rest
            let attempts = entry
                .attempts
                .max(entry.message.retry_count().saturating_add(1));

            let inner = &subscription.inner;
            let delivery_tag = inner.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
            let delivery = Delivery::new(delivery_tag, &queue, entry.message.clone())
                .with_attempts(attempts);

            lock(&inner.in_flight).insert(
                delivery_tag,
                InFlight {
                    queue: mq.clone(),
                    entry,
                    consumer: subscription.id,
                },
            );

            Some((Ok(delivery), (subscription, mq, queue)))
        });

        Ok(deliveries.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), GatewayError> {
        self.settle(delivery_tag).map(|_| ())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), GatewayError> {
        let in_flight = self.settle(delivery_tag)?;
        if requeue {
            in_flight.queue.push(in_flight.entry);
        }
        Ok(())
    }
}
