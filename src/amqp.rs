// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Gateway
//!
//! [`BrokerGateway`] backed by a lapin channel. Dead-letter targets and quorum
//! settings travel as queue arguments, header predicates as binding arguments.
//! Deliveries are converted into the crate's [`Delivery`] type. The delivery
//! count is the largest of what `x-retry-count` (set by consumers that send a
//! message back to its queue), `x-delivery-count` (quorum queues) and the
//! redelivered flag say.

use crate::{
    errors::GatewayError,
    exchange::ExchangeDefinition,
    gateway::{BrokerGateway, DeliveryStream},
    message::{Delivery, Message},
    queue::{MatchSpec, QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};
use uuid::Uuid;

/// Queue argument naming the dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument naming the dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Queue argument selecting the queue type
pub const AMQP_HEADERS_QUEUE_TYPE: &str = "x-queue-type";
/// Value of `x-queue-type` for quorum queues
pub const AMQP_QUEUE_TYPE_QUORUM: &str = "quorum";
/// Binding argument selecting `all` or `any` header matching
pub const AMQP_HEADERS_MATCH: &str = "x-match";
/// Delivery header with the number of prior deliveries (quorum queues)
pub const AMQP_HEADERS_DELIVERY_COUNT: &str = "x-delivery-count";

fn long_string(value: &str) -> AMQPValue {
    AMQPValue::LongString(LongString::from(value.to_owned()))
}

/// Arguments sent with `queue.declare`.
pub(crate) fn queue_arguments(def: &QueueDefinition) -> FieldTable {
    let mut args = BTreeMap::new();

    if let Some(target) = def.dead_letter_target() {
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            long_string(&target.exchange),
        );
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            long_string(&target.routing_key),
        );
    }

    if def.is_quorum() {
        args.insert(
            ShortString::from(AMQP_HEADERS_QUEUE_TYPE),
            long_string(AMQP_QUEUE_TYPE_QUORUM),
        );
    }

    FieldTable::from(args)
}

/// Arguments sent with `queue.bind`.
pub(crate) fn binding_arguments(binding: &QueueBinding) -> FieldTable {
    let mut args = BTreeMap::new();

    if let MatchSpec::Headers(hm) = binding.match_spec() {
        args.insert(ShortString::from(AMQP_HEADERS_MATCH), long_string(hm.mode.as_str()));
        for (key, value) in &hm.pairs {
            args.insert(ShortString::from(key.clone()), long_string(value));
        }
    }

    FieldTable::from(args)
}

fn header_table(headers: &BTreeMap<String, String>) -> FieldTable {
    let table: BTreeMap<ShortString, AMQPValue> = headers
        .iter()
        .map(|(k, v)| (ShortString::from(k.clone()), long_string(v)))
        .collect();
    FieldTable::from(table)
}

fn header_value(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(v) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        AMQPValue::ShortString(v) => Some(v.as_str().to_owned()),
        AMQPValue::Boolean(v) => Some(v.to_string()),
        AMQPValue::ShortInt(v) => Some(v.to_string()),
        AMQPValue::LongInt(v) => Some(v.to_string()),
        AMQPValue::LongLongInt(v) => Some(v.to_string()),
        AMQPValue::LongUInt(v) => Some(v.to_string()),
        _ => None,
    }
}

fn delivery_count(value: &AMQPValue) -> Option<u32> {
    match value {
        AMQPValue::LongLongInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongUInt(v) => Some(*v),
        AMQPValue::ShortInt(v) => u32::try_from(*v).ok(),
        _ => None,
    }
}

/// Converts a lapin delivery into the crate's delivery type.
fn convert_delivery(queue: &str, delivery: lapin::message::Delivery) -> Delivery {
    let lapin::message::Delivery {
        delivery_tag,
        routing_key,
        redelivered,
        properties,
        data,
        ..
    } = delivery;

    delivery_from_parts(
        queue,
        delivery_tag,
        routing_key.as_str(),
        redelivered,
        &properties,
        data,
    )
}

fn delivery_from_parts(
    queue: &str,
    delivery_tag: u64,
    routing_key: &str,
    redelivered: bool,
    props: &BasicProperties,
    data: Vec<u8>,
) -> Delivery {
    let mut headers = BTreeMap::new();
    let mut prior_deliveries = None;

    if let Some(table) = props.headers() {
        for (key, value) in table.inner() {
            if key.as_str() == AMQP_HEADERS_DELIVERY_COUNT {
                prior_deliveries = delivery_count(value);
                continue;
            }
            if let Some(v) = header_value(value) {
                headers.insert(key.as_str().to_owned(), v);
            }
        }
    }

    let mut message = Message::new(data).routing_key(routing_key).headers(headers);
    if let Some(content_type) = props.content_type() {
        message = message.content_type(content_type.as_str());
    }

    // classic queues only tell us whether this copy was seen before
    let attempts = [
        message.retry_count().saturating_add(1),
        prior_deliveries.map_or(1, |count| count.saturating_add(1)),
        if redelivered { 2 } else { 1 },
    ]
    .into_iter()
    .max()
    .unwrap_or(1);

    let mut converted = Delivery::new(delivery_tag, queue, message).with_attempts(attempts);
    converted.redelivered |= redelivered;
    converted
}

/// lapin implementation of the [`BrokerGateway`].
pub struct AmqpGateway {
    channel: Arc<Channel>,
}

impl AmqpGateway {
    pub fn new(channel: Arc<Channel>) -> Arc<AmqpGateway> {
        Arc::new(AmqpGateway { channel })
    }
}

#[async_trait]
impl BrokerGateway for AmqpGateway {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), GatewayError> {
        debug!("creating exchange: {}", def.name());

        match self
            .channel
            .exchange_declare(
                def.name(),
                def.exchange_kind().into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name(),
                    "error to declare the exchange"
                );
                Err(GatewayError::DeclareExchangeError(def.name().to_owned()))
            }
            _ => {
                debug!("exchange: {} was created", def.name());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), GatewayError> {
        debug!("creating queue: {}", def.name());

        match self
            .channel
            .queue_declare(
                def.name(),
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                queue_arguments(def),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = def.name(), "error to declare the queue");
                Err(GatewayError::DeclareQueueError(def.name().to_owned()))
            }
            _ => {
                debug!("queue: {} was created", def.name());
                Ok(())
            }
        }
    }

    async fn bind(&self, binding: &QueueBinding) -> Result<(), GatewayError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name(),
            binding.exchange_name(),
            binding.broker_routing_key()
        );

        match self
            .channel
            .queue_bind(
                binding.queue_name(),
                binding.exchange_name(),
                binding.broker_routing_key(),
                QueueBindOptions { nowait: false },
                binding_arguments(binding),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(GatewayError::BindingExchangeToQueueError(
                    binding.exchange_name().to_owned(),
                    binding.queue_name().to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn publish(&self, exchange: &str, message: &Message) -> Result<(), GatewayError> {
        match self
            .channel
            .basic_publish(
                exchange,
                message.effective_key(),
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                message.body(),
                BasicProperties::default()
                    .with_content_type(ShortString::from(message.get_content_type().to_owned()))
                    .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
                    .with_headers(header_table(message.header_map())),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), exchange, "error publishing message");
                Err(GatewayError::PublishingError(exchange.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn send_to_queue(&self, queue: &str, message: &Message) -> Result<(), GatewayError> {
        // the default exchange routes on the queue name
        match self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                message.body(),
                BasicProperties::default()
                    .with_content_type(ShortString::from(message.get_content_type().to_owned()))
                    .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
                    .with_headers(header_table(message.header_map())),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error sending message back to queue");
                Err(GatewayError::PublishingError(queue.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, GatewayError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "failure to create the consumer");
                Err(GatewayError::ConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let queue = queue.to_owned();
        let deliveries = consumer.map(move |result| match result {
            Ok(delivery) => Ok(convert_delivery(&queue, delivery)),
            Err(err) => {
                error!(error = err.to_string(), "errors consume msg");
                Err(GatewayError::ConsumerError(queue.clone()))
            }
        });

        Ok(deliveries.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), GatewayError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error whiling ack msg");
                GatewayError::AckMessageError(delivery_tag)
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), GatewayError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error whiling nack msg");
                GatewayError::NackMessageError(delivery_tag)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{consumer::RedeliveryPolicy, message::AMQP_HEADERS_RETRY_COUNT, queue::HeaderMatch};

    fn text(table: &FieldTable, key: &str) -> Option<String> {
        table.inner().get(key).and_then(header_value)
    }

    #[test]
    fn dead_letter_and_quorum_queue_arguments() {
        let def = QueueDefinition::new("normalQ2")
            .quorum()
            .dead_letter("DeadExchange", "dq");
        let args = queue_arguments(&def);

        assert_eq!(
            text(&args, AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some("DeadExchange".into())
        );
        assert_eq!(text(&args, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY), Some("dq".into()));
        assert_eq!(text(&args, AMQP_HEADERS_QUEUE_TYPE), Some("quorum".into()));
    }

    #[test]
    fn classic_queue_has_no_arguments() {
        assert!(queue_arguments(&QueueDefinition::new("q")).inner().is_empty());
    }

    #[test]
    fn header_binding_arguments() {
        let binding = QueueBinding::new("HQ2")
            .exchange("H")
            .headers(HeaderMatch::any().pair("a", "b"));
        let args = binding_arguments(&binding);

        assert_eq!(text(&args, AMQP_HEADERS_MATCH), Some("any".into()));
        assert_eq!(text(&args, "a"), Some("b".into()));
        assert_eq!(binding.broker_routing_key(), "");
    }

    #[test]
    fn key_binding_has_no_arguments() {
        let binding = QueueBinding::new("q").exchange("E").routing_key("q1");
        assert!(binding_arguments(&binding).inner().is_empty());
        assert_eq!(binding.broker_routing_key(), "q1");
    }

    fn properties(headers: &[(&str, AMQPValue)]) -> BasicProperties {
        let table: BTreeMap<ShortString, AMQPValue> = headers
            .iter()
            .map(|(k, v)| (ShortString::from(k.to_string()), v.clone()))
            .collect();
        BasicProperties::default()
            .with_content_type(ShortString::from("text/plain".to_owned()))
            .with_headers(FieldTable::from(table))
    }

    #[test]
    fn first_delivery_on_a_classic_queue() {
        let props = properties(&[("a", long_string("b"))]);
        let d = delivery_from_parts("q1", 5, "k", false, &props, b"body".to_vec());

        assert_eq!(d.delivery_tag, 5);
        assert_eq!(d.queue, "q1");
        assert_eq!(d.attempts, 1);
        assert!(!d.redelivered);
        assert_eq!(d.message.body(), b"body");
        assert_eq!(d.message.key(), Some("k"));
        assert_eq!(d.message.header_map().get("a"), Some(&"b".to_owned()));
    }

    #[test]
    fn retry_count_header_drives_attempts_past_the_redelivered_flag() {
        let props = properties(&[(AMQP_HEADERS_RETRY_COUNT, long_string("9"))]);
        let d = delivery_from_parts("q2", 1, "q2", false, &props, b"x".to_vec());

        assert_eq!(d.attempts, 10);
        assert!(d.redelivered);
        assert!(RedeliveryPolicy::default().exhausted(d.attempts));

        let props = properties(&[(AMQP_HEADERS_RETRY_COUNT, AMQPValue::LongInt(2))]);
        let d = delivery_from_parts("q2", 2, "q2", true, &props, b"x".to_vec());
        assert_eq!(d.attempts, 3);
    }

    #[test]
    fn quorum_delivery_count_is_consumed_not_copied() {
        let props = properties(&[(AMQP_HEADERS_DELIVERY_COUNT, AMQPValue::LongLongInt(4))]);
        let d = delivery_from_parts("orderQ", 1, "a.Order.b", true, &props, b"x".to_vec());

        assert_eq!(d.attempts, 5);
        assert!(!d.message.header_map().contains_key(AMQP_HEADERS_DELIVERY_COUNT));
    }

    #[test]
    fn redelivered_flag_alone_counts_as_second_attempt() {
        let d = delivery_from_parts("q", 1, "q", true, &BasicProperties::default(), Vec::new());
        assert_eq!(d.attempts, 2);
        assert!(d.redelivered);
    }

    #[test]
    fn delivery_count_values() {
        assert_eq!(delivery_count(&AMQPValue::LongLongInt(2)), Some(2));
        assert_eq!(delivery_count(&AMQPValue::LongInt(-1)), None);
        assert_eq!(delivery_count(&long_string("3")), None);
    }
}
