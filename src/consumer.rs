// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Loop
//!
//! One loop drains one queue under one consumer tag. Each delivery is handed to
//! a [`ConsumerHandler`], and the handler's decision is applied exactly once:
//!
//! - `Ack` removes the message
//! - `NackRequeue` sends a copy back to the tail of the queue with its
//!   `x-retry-count` header bumped and acks the original, until the redelivery
//!   policy is exhausted
//! - `NackDiscard` forwards it to the queue's dead-letter target, or drops it
//!   when there is none
//!
//! Messages forwarded by the loop are settled with an ack, never a plain nack,
//! so broker-side dead-lettering does not produce a second copy.
//!
//! Cancellation is observed before fetching. A delivery that was fetched is
//! always handled and settled before the loop exits.

use crate::{
    errors::{GatewayError, HandlerError, PublishError},
    gateway::{BrokerGateway, DeliveryStream},
    message::{AckDecision, Delivery, Settlement},
    otel,
    publisher::Publisher,
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use opentelemetry::{
    global::{self, BoxedSpan},
    trace::{Span, Status},
};
use std::{borrow::Cow, sync::Arc};
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Dead-letter reason for messages rejected by their handler
pub const DEATH_REASON_REJECTED: &str = "rejected";
/// Dead-letter reason for messages whose redeliveries were exhausted
pub const DEATH_REASON_DELIVERY_LIMIT: &str = "delivery-limit";

/// Processes deliveries for a delivery loop.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Result<AckDecision, HandlerError>;
}

/// Handler that answers every delivery with the same decision.
#[derive(Debug, Clone, Copy)]
pub struct DecisionHandler {
    decision: AckDecision,
}

impl DecisionHandler {
    pub fn new(decision: AckDecision) -> Arc<DecisionHandler> {
        Arc::new(DecisionHandler { decision })
    }
}

#[async_trait]
impl ConsumerHandler for DecisionHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<AckDecision, HandlerError> {
        debug!(
            queue = delivery.queue.as_str(),
            delivery_tag = delivery.delivery_tag,
            redelivered = delivery.redelivered,
            body = %String::from_utf8_lossy(delivery.message.body()),
            "message received"
        );
        Ok(self.decision)
    }
}

/// Upper bound on how often a message may be requeued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    pub max_redeliveries: u32,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        RedeliveryPolicy { max_redeliveries: 3 }
    }
}

impl RedeliveryPolicy {
    pub fn new(max_redeliveries: u32) -> Self {
        RedeliveryPolicy { max_redeliveries }
    }

    /// Whether a delivery on its `attempts`-th try may not be requeued again.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts > self.max_redeliveries
    }
}

/// States of a delivery loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Fetching,
    Handling,
    Acking,
    Nacking,
    Stopped,
}

/// Settlement counters of a delivery loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub discarded: u64,
}

impl LoopStats {
    fn record(&mut self, settlement: Settlement) {
        match settlement {
            Settlement::Acked => self.acked += 1,
            Settlement::Requeued => self.requeued += 1,
            Settlement::DeadLettered => self.dead_lettered += 1,
            Settlement::Discarded => self.discarded += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.acked + self.requeued + self.dead_lettered + self.discarded
    }
}

/// Consumer for a single (queue, consumer tag) pair.
pub struct DeliveryLoop {
    queue: QueueDefinition,
    consumer_tag: String,
    gateway: Arc<dyn BrokerGateway>,
    publisher: Arc<Publisher>,
    handler: Arc<dyn ConsumerHandler>,
    policy: RedeliveryPolicy,
    state: LoopState,
}

impl DeliveryLoop {
    pub fn new(
        queue: QueueDefinition,
        consumer_tag: &str,
        gateway: Arc<dyn BrokerGateway>,
        publisher: Arc<Publisher>,
        handler: Arc<dyn ConsumerHandler>,
        policy: RedeliveryPolicy,
    ) -> DeliveryLoop {
        DeliveryLoop {
            queue,
            consumer_tag: consumer_tag.to_owned(),
            gateway,
            publisher,
            handler,
            policy,
            state: LoopState::Idle,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    fn transition(&mut self, state: LoopState) {
        debug!(
            queue = self.queue.name(),
            consumer_tag = self.consumer_tag.as_str(),
            from = ?self.state,
            to = ?state,
            "delivery loop transition"
        );
        self.state = state;
    }

    /// Runs until `shutdown` flips to `true` or its sender is dropped.
    ///
    /// Gateway failures end the loop with an error; the current delivery is
    /// settled first whenever the gateway still allows it.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<LoopStats, GatewayError> {
        let mut stats = LoopStats::default();
        let mut deliveries: Option<DeliveryStream> = None;
        let tracer = global::tracer("amqp consumer");

        loop {
            self.transition(LoopState::Idle);
            if *shutdown.borrow() {
                break;
            }

            if deliveries.is_none() {
                let stream = self
                    .gateway
                    .consume(self.queue.name(), &self.consumer_tag)
                    .await?;
                deliveries = Some(stream);
            }
            let Some(stream) = deliveries.as_mut() else {
                continue;
            };

            self.transition(LoopState::Fetching);
            let next = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        debug!(queue = self.queue.name(), "shutdown sender dropped");
                        break;
                    }
                    continue;
                }
                next = stream.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(err)) => {
                    error!(error = err.to_string(), queue = self.queue.name(), "errors consume msg");
                    self.transition(LoopState::Stopped);
                    return Err(err);
                }
                None => {
                    // consumer ended without cancellation, subscribe again
                    warn!(queue = self.queue.name(), "delivery stream ended, restarting consumer");
                    deliveries = None;
                    continue;
                }
            };

            self.transition(LoopState::Handling);
            let (_, mut span) = otel::new_span(delivery.message.header_map(), &tracer, self.queue.name());

            let decision = match self.handler.handle(&delivery).await {
                Ok(decision) => decision,
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        delivery_tag = delivery.delivery_tag,
                        "handler failure"
                    );
                    span.record_error(&err);
                    err.decision()
                }
            };

            match self.settle(delivery, decision, &mut span).await {
                Ok(settlement) => {
                    stats.record(settlement);
                    span.set_status(Status::Ok);
                }
                Err(err) => {
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from(err.to_string()),
                    });
                    self.transition(LoopState::Stopped);
                    return Err(err);
                }
            }
        }

        self.transition(LoopState::Stopped);
        debug!(queue = self.queue.name(), ?stats, "delivery loop stopped");
        Ok(stats)
    }

    /// Applies a decision to a delivery. Taking the delivery by value makes it
    /// impossible to settle the same delivery twice from the loop.
    pub(crate) async fn settle(
        &mut self,
        delivery: Delivery,
        decision: AckDecision,
        span: &mut BoxedSpan,
    ) -> Result<Settlement, GatewayError> {
        let tag = delivery.delivery_tag;

        match decision {
            AckDecision::Ack => {
                self.transition(LoopState::Acking);
                self.gateway.ack(tag).await?;
                debug!(delivery_tag = tag, "message successfully processed");
                Ok(Settlement::Acked)
            }
            AckDecision::NackRequeue if !self.policy.exhausted(delivery.attempts) => {
                self.transition(LoopState::Nacking);
                warn!(
                    delivery_tag = tag,
                    attempts = delivery.attempts,
                    "error whiling handling msg, requeuing for latter"
                );
                let retry = delivery.message.with_retry_count(delivery.attempts);
                if let Err(err) = self.gateway.send_to_queue(self.queue.name(), &retry).await {
                    error!(error = err.to_string(), "error whiling requeuing");
                    if let Err(nack_err) = self.gateway.nack(tag, true).await {
                        error!(error = nack_err.to_string(), "error whiling nack msg");
                    }
                    return Err(err);
                }
                self.gateway.ack(tag).await?;
                Ok(Settlement::Requeued)
            }
            AckDecision::NackRequeue => {
                error!(
                    delivery_tag = tag,
                    attempts = delivery.attempts,
                    "too many attempts, discarding"
                );
                span.set_status(Status::Error {
                    description: Cow::from("redeliveries exhausted"),
                });
                self.discard(delivery, DEATH_REASON_DELIVERY_LIMIT).await
            }
            AckDecision::NackDiscard => self.discard(delivery, DEATH_REASON_REJECTED).await,
        }
    }

    async fn discard(&mut self, delivery: Delivery, reason: &str) -> Result<Settlement, GatewayError> {
        self.transition(LoopState::Nacking);
        let tag = delivery.delivery_tag;

        let Some(target) = self.queue.dead_letter_target().cloned() else {
            self.gateway.nack(tag, false).await?;
            debug!(delivery_tag = tag, "message discarded");
            return Ok(Settlement::Discarded);
        };

        if delivery.message.dead_lettered_to(&target) {
            warn!(
                delivery_tag = tag,
                exchange = target.exchange.as_str(),
                "message already dead-lettered to this target, discarding"
            );
            self.gateway.ack(tag).await?;
            return Ok(Settlement::Discarded);
        }

        let dead = delivery
            .message
            .to_dead_letter(self.queue.name(), &target, reason);

        match self.publisher.publish(&target.exchange, &dead).await {
            Ok(outcome) => {
                debug!(
                    delivery_tag = tag,
                    exchange = target.exchange.as_str(),
                    queues = outcome.matched_queues.len(),
                    "message sent to dead-letter exchange"
                );
                self.gateway.ack(tag).await?;
                Ok(Settlement::DeadLettered)
            }
            Err(PublishError::UnknownExchange(exchange)) => {
                error!(exchange, "dead-letter exchange missing from topology, discarding");
                self.gateway.ack(tag).await?;
                Ok(Settlement::Discarded)
            }
            Err(PublishError::Gateway(err)) => {
                error!(error = err.to_string(), "error whiling sending to dlq");
                // keep the message on the broker rather than losing it
                if let Err(nack_err) = self.gateway.nack(tag, true).await {
                    error!(error = nack_err.to_string(), "error whiling requeuing");
                }
                Err(err)
            }
        }
    }
}
