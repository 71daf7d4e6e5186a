// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages and Deliveries
//!
//! A [`Message`] is created per publish call and never mutated afterwards. A
//! [`Delivery`] wraps a message handed to a consumer together with the metadata
//! the gateway assigned to it. Every delivery ends in exactly one [`Settlement`].

use crate::queue::DeadLetterTarget;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default content type for plain text messages
pub const TEXT_CONTENT_TYPE: &str = "text/plain";

/// Header carrying the exchange a message was dead-lettered to
pub const AMQP_HEADERS_DEATH_EXCHANGE: &str = "x-death-exchange";
/// Header carrying the routing key a message was dead-lettered with
pub const AMQP_HEADERS_DEATH_ROUTING_KEY: &str = "x-death-routing-key";
/// Header carrying the queue a message was dead-lettered from
pub const AMQP_HEADERS_DEATH_QUEUE: &str = "x-death-queue";
/// Header carrying why a message was dead-lettered
pub const AMQP_HEADERS_DEATH_REASON: &str = "x-death-reason";
/// Header counting how many times a consumer sent a message back to its queue
pub const AMQP_HEADERS_RETRY_COUNT: &str = "x-retry-count";

/// An outbound message. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    body: Vec<u8>,
    routing_key: Option<String>,
    headers: BTreeMap<String, String>,
    content_type: String,
}

impl Message {
    /// Creates a `text/plain` message without routing key or headers.
    pub fn new(body: impl Into<Vec<u8>>) -> Message {
        Message {
            body: body.into(),
            routing_key: None,
            headers: BTreeMap::default(),
            content_type: TEXT_CONTENT_TYPE.to_owned(),
        }
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = Some(key.to_owned());
        self
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_owned();
        self
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn key(&self) -> Option<&str> {
        self.routing_key.as_deref()
    }

    /// The routing key as the broker sees it: absent keys are empty strings.
    pub fn effective_key(&self) -> &str {
        self.routing_key.as_deref().unwrap_or_default()
    }

    pub fn header_map(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn get_content_type(&self) -> &str {
        &self.content_type
    }

    /// Whether this message was already dead-lettered to `target`.
    pub fn dead_lettered_to(&self, target: &DeadLetterTarget) -> bool {
        self.headers.get(AMQP_HEADERS_DEATH_EXCHANGE) == Some(&target.exchange)
            && self.headers.get(AMQP_HEADERS_DEATH_ROUTING_KEY) == Some(&target.routing_key)
    }

    /// Copy of this message addressed to `target`, marked with where it died and why.
    ///
    /// Body, content type and existing headers are preserved.
    pub fn to_dead_letter(&self, queue: &str, target: &DeadLetterTarget, reason: &str) -> Message {
        self.clone()
            .routing_key(&target.routing_key)
            .header(AMQP_HEADERS_DEATH_EXCHANGE, &target.exchange)
            .header(AMQP_HEADERS_DEATH_ROUTING_KEY, &target.routing_key)
            .header(AMQP_HEADERS_DEATH_QUEUE, queue)
            .header(AMQP_HEADERS_DEATH_REASON, reason)
    }

    /// Times this message was sent back to its queue. Missing or malformed
    /// headers count as zero.
    pub fn retry_count(&self) -> u32 {
        self.headers
            .get(AMQP_HEADERS_RETRY_COUNT)
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or_default()
    }

    /// Copy of this message with its retry count replaced.
    pub fn with_retry_count(&self, count: u32) -> Message {
        self.clone().header(AMQP_HEADERS_RETRY_COUNT, &count.to_string())
    }

    /// Copy of this message carrying extra headers, used for trace propagation.
    pub(crate) fn with_extra_headers(&self, extra: BTreeMap<String, String>) -> Message {
        let mut message = self.clone();
        message.headers.extend(extra);
        message
    }
}

/// A message handed to a consumer with its gateway-assigned metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub queue: String,
    pub redelivered: bool,
    /// How many times this message has been delivered, counting this delivery.
    pub attempts: u32,
    pub message: Message,
}

impl Delivery {
    pub fn new(delivery_tag: u64, queue: &str, message: Message) -> Delivery {
        Delivery {
            delivery_tag,
            queue: queue.to_owned(),
            redelivered: false,
            attempts: 1,
            message,
        }
    }

    /// Sets the delivery count; any count above one marks the delivery as redelivered.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self.redelivered |= self.attempts > 1;
        self
    }
}

/// Decision a handler returns for a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckDecision {
    Ack,
    NackRequeue,
    NackDiscard,
}

/// Terminal acknowledgment state of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Settlement {
    Acked,
    Requeued,
    DeadLettered,
    Discarded,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_letter_copy_keeps_payload() {
        let target = DeadLetterTarget::new("DeadExchange", "dq");
        let msg = Message::new("payload").routing_key("q2").header("a", "b");
        let dead = msg.to_dead_letter("normalQ2", &target, "rejected");

        assert_eq!(dead.body(), msg.body());
        assert_eq!(dead.get_content_type(), TEXT_CONTENT_TYPE);
        assert_eq!(dead.key(), Some("dq"));
        assert_eq!(dead.header_map().get("a"), Some(&"b".to_owned()));
        assert!(dead.dead_lettered_to(&target));
        assert!(!msg.dead_lettered_to(&target));
        assert!(!dead.dead_lettered_to(&DeadLetterTarget::new("Other", "dq")));
    }

    #[test]
    fn missing_routing_key_is_empty() {
        assert_eq!(Message::new("x").effective_key(), "");
        assert_eq!(Message::new("x").routing_key("a.b").effective_key(), "a.b");
    }

    #[test]
    fn redelivery_metadata() {
        let d = Delivery::new(7, "q", Message::new("x"));
        assert!(!d.redelivered);
        assert_eq!(d.attempts, 1);

        let d = d.with_attempts(3);
        assert!(d.redelivered);
        assert_eq!(d.attempts, 3);
    }

    #[test]
    fn retry_count_header() {
        let msg = Message::new("x").header("a", "b");
        assert_eq!(msg.retry_count(), 0);

        let retried = msg.with_retry_count(2);
        assert_eq!(retried.retry_count(), 2);
        assert_eq!(retried.with_retry_count(3).retry_count(), 3);
        assert_eq!(retried.header_map().get("a"), Some(&"b".to_owned()));
        assert_eq!(retried.body(), msg.body());

        assert_eq!(Message::new("x").header(AMQP_HEADERS_RETRY_COUNT, "lots").retry_count(), 0);
    }
}
