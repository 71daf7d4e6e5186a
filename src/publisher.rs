// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Resolves the queues a message reaches through the routing engine, then hands
//! the message to the broker gateway. Messages that match no queue are not an
//! error: they are dropped, like an AMQP publish with `mandatory=false`, and
//! counted.

use crate::{
    errors::PublishError,
    gateway::BrokerGateway,
    message::Message,
    otel,
    topology::Topology,
};
use opentelemetry::Context;
use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{debug, error, warn};

/// Result of a successful publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    pub matched_queues: BTreeSet<String>,
}

impl PublishOutcome {
    pub fn is_routed(&self) -> bool {
        !self.matched_queues.is_empty()
    }
}

/// Publishes messages against a read-only topology snapshot.
pub struct Publisher {
    topology: Arc<Topology>,
    gateway: Arc<dyn BrokerGateway>,
    unroutable: AtomicU64,
}

impl Publisher {
    pub fn new(topology: Arc<Topology>, gateway: Arc<dyn BrokerGateway>) -> Arc<Publisher> {
        Arc::new(Publisher {
            topology,
            gateway,
            unroutable: AtomicU64::new(0),
        })
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// Number of publishes that matched no queue.
    pub fn unroutable_count(&self) -> u64 {
        self.unroutable.load(Ordering::SeqCst)
    }

    /// Publishes a message to an exchange.
    ///
    /// The current trace context is injected into the outgoing headers. Routing
    /// is decided on the message as given.
    pub async fn publish(&self, exchange: &str, message: &Message) -> Result<PublishOutcome, PublishError> {
        let matched_queues = self.topology.route(exchange, message).map_err(|_| {
            error!(exchange, "publishing to an undeclared exchange");
            PublishError::UnknownExchange(exchange.to_owned())
        })?;

        if matched_queues.is_empty() {
            warn!(exchange, key = message.effective_key(), "message matched no queue");
            self.unroutable.fetch_add(1, Ordering::SeqCst);
        }

        let outgoing = message.with_extra_headers(otel::inject(&Context::current()));

        self.gateway.publish(exchange, &outgoing).await?;

        debug!(
            exchange,
            key = message.effective_key(),
            queues = matched_queues.len(),
            "message published"
        );

        Ok(PublishOutcome { matched_queues })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::GatewayError,
        exchange::ExchangeDefinition,
        gateway::MockBrokerGateway,
        memory::InMemoryBroker,
        queue::{MatchSpec, QueueDefinition},
        topology::TopologyManager,
    };

    fn direct_topology() -> TopologyManager {
        let mut manager = TopologyManager::new();
        manager.declare_exchange(ExchangeDefinition::new("E")).unwrap();
        manager.declare_queue(QueueDefinition::new("q1")).unwrap();
        manager.declare_queue(QueueDefinition::new("q2")).unwrap();
        manager.bind("E", "q1", MatchSpec::Key("a".into())).unwrap();
        manager.bind("E", "q2", MatchSpec::Key("b".into())).unwrap();
        manager
    }

    #[tokio::test]
    async fn publish_enqueues_into_matched_queues() {
        let manager = direct_topology();
        let broker = Arc::new(InMemoryBroker::new());
        manager.install(broker.as_ref()).await.unwrap();

        let publisher = Publisher::new(manager.snapshot(), broker.clone());
        let outcome = publisher
            .publish("E", &Message::new("hello").routing_key("a"))
            .await
            .unwrap();

        assert_eq!(outcome.matched_queues, BTreeSet::from(["q1".to_owned()]));
        assert_eq!(broker.depth("q1"), 1);
        assert_eq!(broker.depth("q2"), 0);
    }

    #[tokio::test]
    async fn unroutable_publish_succeeds_with_empty_outcome() {
        let manager = direct_topology();
        let broker = Arc::new(InMemoryBroker::new());
        manager.install(broker.as_ref()).await.unwrap();

        let publisher = Publisher::new(manager.snapshot(), broker.clone());
        let outcome = publisher
            .publish("E", &Message::new("lost").routing_key("nobody"))
            .await
            .unwrap();

        assert!(!outcome.is_routed());
        assert_eq!(publisher.unroutable_count(), 1);
        assert_eq!(broker.unroutable_count(), 1);
    }

    #[tokio::test]
    async fn unknown_exchange_never_reaches_the_gateway() {
        let mut gateway = MockBrokerGateway::new();
        gateway.expect_publish().never();

        let publisher = Publisher::new(direct_topology().snapshot(), Arc::new(gateway));
        assert_eq!(
            publisher.publish("missing", &Message::new("x")).await,
            Err(PublishError::UnknownExchange("missing".into()))
        );
    }

    #[tokio::test]
    async fn gateway_failures_are_propagated() {
        let mut gateway = MockBrokerGateway::new();
        gateway
            .expect_publish()
            .times(1)
            .returning(|ex, _| Err(GatewayError::PublishingError(ex.to_owned())));

        let publisher = Publisher::new(direct_topology().snapshot(), Arc::new(gateway));
        assert_eq!(
            publisher
                .publish("E", &Message::new("x").routing_key("a"))
                .await,
            Err(PublishError::Gateway(GatewayError::PublishingError("E".into())))
        );
    }
}
