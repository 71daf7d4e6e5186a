// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Gateway
//!
//! The narrow interface between the core and whatever actually holds messages:
//! the in-process [`crate::memory::InMemoryBroker`] or a real broker through
//! [`crate::amqp::AmqpGateway`]. Connection and channel ownership stay behind
//! this trait.

use crate::{
    errors::GatewayError,
    exchange::ExchangeDefinition,
    message::{Delivery, Message},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;

#[cfg(test)]
use mockall::automock;

/// Lazy sequence of deliveries from one queue.
///
/// The stream only ends when the underlying consumer is cancelled; consuming
/// again restarts it.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, GatewayError>>;

/// Declare, bind, publish and consume primitives touching a broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), GatewayError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), GatewayError>;

    async fn bind(&self, binding: &QueueBinding) -> Result<(), GatewayError>;

    /// Publishes a message to an exchange using its routing key and headers.
    async fn publish(&self, exchange: &str, message: &Message) -> Result<(), GatewayError>;

    /// Places a message directly at the tail of a queue, bypassing exchanges.
    async fn send_to_queue(&self, queue: &str, message: &Message) -> Result<(), GatewayError>;

    /// Starts consuming a queue under the given consumer tag.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, GatewayError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), GatewayError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), GatewayError>;
}
