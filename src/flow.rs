// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Flows
//!
//! A flow is one exchange, the queues bound to it, an optional dead-letter
//! exchange and queue, the messages seeded into it and the consumers that drain
//! it. The four routing disciplines are four [`FlowDefinition`] values run
//! through the same setup, publish and consume steps.
//!
//! Flows are isolated from each other: a flow whose topology cannot be
//! established, or whose consumers fail, ends with its own error while the other
//! flows keep running.

use crate::{
    consumer::{DecisionHandler, LoopStats, RedeliveryPolicy},
    dispatcher::Dispatcher,
    errors::{FlowError, TopologyError},
    exchange::ExchangeDefinition,
    gateway::BrokerGateway,
    message::{AckDecision, Message, TEXT_CONTENT_TYPE},
    publisher::{PublishOutcome, Publisher},
    queue::{HeaderMatch, QueueDefinition},
    topology::TopologyManager,
};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Body of every seeded message in the built-in flows.
pub const SEED_MESSAGE: &str = "This is a message for the consumer";

/// Dead-letter exchange and the queue that collects its messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterDefinition {
    pub exchange: ExchangeDefinition,
    pub queue: QueueDefinition,
}

/// A message published when the flow starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publication {
    #[serde(default)]
    pub routing_key: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl Publication {
    pub fn new(body: &str) -> Self {
        Publication {
            routing_key: None,
            headers: BTreeMap::new(),
            body: body.to_owned(),
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

    pub fn to_message(&self) -> Message {
        let message = Message::new(self.body.as_bytes())
            .content_type(TEXT_CONTENT_TYPE)
            .headers(self.headers.clone());

        match &self.routing_key {
            Some(key) => message.routing_key(key),
            None => message,
        }
    }
}

/// A consumer answering every delivery of a queue with a fixed decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerDefinition {
    pub queue: String,
    pub decision: AckDecision,
}

impl ConsumerDefinition {
    pub fn new(queue: &str, decision: AckDecision) -> Self {
        ConsumerDefinition {
            queue: queue.to_owned(),
            decision,
        }
    }
}

/// Static description of a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub name: String,
    pub exchange: ExchangeDefinition,
    #[serde(default)]
    pub queues: Vec<QueueDefinition>,
    #[serde(default)]
    pub dead_letter: Option<DeadLetterDefinition>,
    #[serde(default)]
    pub publications: Vec<Publication>,
    #[serde(default)]
    pub consumers: Vec<ConsumerDefinition>,
}

impl FlowDefinition {
    /// Builds the topology of the flow, dead-letter side first.
    pub fn topology(&self) -> Result<TopologyManager, TopologyError> {
        let mut manager = TopologyManager::new();

        if let Some(dl) = &self.dead_letter {
            manager.declare_exchange(dl.exchange.clone())?;
            manager.declare_queue(dl.queue.clone())?;
            manager.bind(dl.exchange.name(), dl.queue.name(), dl.queue.match_spec())?;
        }

        manager.declare_exchange(self.exchange.clone())?;
        for queue in &self.queues {
            manager.declare_queue(queue.clone())?;
        }
        for queue in &self.queues {
            manager.bind(self.exchange.name(), queue.name(), queue.match_spec())?;
        }

        Ok(manager)
    }
}

/// A flow whose topology is installed on a broker.
pub struct Flow {
    definition: FlowDefinition,
    gateway: Arc<dyn BrokerGateway>,
    publisher: Arc<Publisher>,
}

impl Flow {
    /// Validates the flow's topology and installs it on the gateway.
    pub async fn setup(definition: FlowDefinition, gateway: Arc<dyn BrokerGateway>) -> Result<Flow, FlowError> {
        let manager = definition.topology().map_err(|err| {
            error!(flow = definition.name.as_str(), error = err.to_string(), "invalid topology");
            FlowError::Topology(definition.name.clone(), err)
        })?;

        manager.install(gateway.as_ref()).await?;
        debug!(flow = definition.name.as_str(), "topology ready");

        let publisher = Publisher::new(manager.snapshot(), gateway.clone());

        Ok(Flow {
            definition,
            gateway,
            publisher,
        })
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    /// Publishes the seed messages in declaration order.
    pub async fn publish_all(&self) -> Result<Vec<PublishOutcome>, FlowError> {
        let mut outcomes = Vec::with_capacity(self.definition.publications.len());
        for publication in &self.definition.publications {
            let outcome = self
                .publisher
                .publish(self.definition.exchange.name(), &publication.to_message())
                .await?;
            outcomes.push(outcome);
        }

        info!(
            flow = self.name(),
            published = outcomes.len(),
            "seed messages published"
        );
        Ok(outcomes)
    }

    /// One delivery loop per consumer of the flow.
    pub fn dispatcher(&self, policy: RedeliveryPolicy) -> Dispatcher {
        self.definition.consumers.iter().fold(
            Dispatcher::new(self.gateway.clone(), self.publisher.clone(), policy),
            |dispatcher, consumer| {
                dispatcher.register(&consumer.queue, DecisionHandler::new(consumer.decision))
            },
        )
    }

    /// Publishes the seed messages, then consumes until `shutdown` or a failure.
    pub async fn run(
        &self,
        policy: RedeliveryPolicy,
        shutdown: watch::Receiver<bool>,
    ) -> Result<BTreeMap<String, LoopStats>, FlowError> {
        self.publish_all().await?;
        self.dispatcher(policy).consume_blocking(shutdown).await
    }
}

/// Outcome of one flow run by [`run_flows`].
pub type FlowResult = (String, Result<BTreeMap<String, LoopStats>, FlowError>);

async fn run_flow(
    definition: FlowDefinition,
    gateway: Arc<dyn BrokerGateway>,
    policy: RedeliveryPolicy,
    shutdown: watch::Receiver<bool>,
) -> Result<BTreeMap<String, LoopStats>, FlowError> {
    info!(flow = definition.name.as_str(), "starting flow");
    let flow = Flow::setup(definition, gateway).await?;
    flow.run(policy, shutdown).await
}

/// Runs every flow concurrently and reports each flow's result in input order.
pub async fn run_flows(
    definitions: Vec<FlowDefinition>,
    gateway: Arc<dyn BrokerGateway>,
    policy: RedeliveryPolicy,
    shutdown: watch::Receiver<bool>,
) -> Vec<FlowResult> {
    let handles: Vec<_> = definitions
        .into_iter()
        .map(|def| {
            let name = def.name.clone();
            let handle = tokio::spawn(run_flow(def, gateway.clone(), policy, shutdown.clone()));
            (name, handle)
        })
        .collect();

    let names: Vec<String> = handles.iter().map(|(name, _)| name.clone()).collect();
    let joined = join_all(handles.into_iter().map(|(_, handle)| handle)).await;

    names
        .into_iter()
        .zip(joined)
        .map(|(name, joined)| {
            let result = joined.unwrap_or_else(|err| Err(FlowError::InternalError(err.to_string())));
            match &result {
                Ok(stats) => info!(flow = name.as_str(), consumers = stats.len(), "flow finished"),
                Err(err) => error!(flow = name.as_str(), error = err.to_string(), "flow failure"),
            }
            (name, result)
        })
        .collect()
}

/// Direct exchange with two queues; the second dead-letters to `DeadExchange`.
pub fn direct() -> FlowDefinition {
    let dead_letter = DeadLetterDefinition {
        exchange: ExchangeDefinition::new("DeadExchange").direct(),
        queue: QueueDefinition::new("dead-q").binding_key("dq"),
    };

    FlowDefinition {
        name: "DirectExchange-normalQueue".to_owned(),
        exchange: ExchangeDefinition::new("DirectExchange-normalQueue").direct(),
        queues: vec![
            QueueDefinition::new("normalQ1").binding_key("q1"),
            QueueDefinition::new("normalQ2")
                .binding_key("q2")
                .dead_letter(dead_letter.exchange.name(), "dq"),
        ],
        dead_letter: Some(dead_letter),
        publications: vec![
            Publication::new(SEED_MESSAGE).routing_key("q1"),
            Publication::new(SEED_MESSAGE).routing_key("q2"),
        ],
        consumers: vec![
            ConsumerDefinition::new("normalQ1", AckDecision::Ack),
            ConsumerDefinition::new("normalQ2", AckDecision::NackDiscard),
            ConsumerDefinition::new("dead-q", AckDecision::Ack),
        ],
    }
}

/// Topic exchange feeding a quorum queue and a classic queue.
pub fn topic() -> FlowDefinition {
    FlowDefinition {
        name: "TopicExchange-normalQueue".to_owned(),
        exchange: ExchangeDefinition::new("TopicExchange-normalQueue").topic(),
        queues: vec![
            QueueDefinition::new("orderQ").quorum().binding_key("*.Order.*"),
            QueueDefinition::new("payQ").binding_key("pay.#"),
        ],
        dead_letter: None,
        publications: vec![
            Publication::new(SEED_MESSAGE).routing_key("a.Order.b"),
            Publication::new(SEED_MESSAGE).routing_key("pay.from.atm"),
        ],
        consumers: vec![
            ConsumerDefinition::new("orderQ", AckDecision::Ack),
            ConsumerDefinition::new("payQ", AckDecision::NackDiscard),
        ],
    }
}

/// Fanout exchange copying each message to two queues.
pub fn fanout() -> FlowDefinition {
    FlowDefinition {
        name: "FanoutExchange-normalQueue".to_owned(),
        exchange: ExchangeDefinition::new("FanoutExchange-normalQueue").fanout(),
        queues: vec![
            QueueDefinition::new("Q1").binding_key("fanout"),
            QueueDefinition::new("Q2").binding_key("fanout"),
        ],
        dead_letter: None,
        publications: vec![Publication::new(SEED_MESSAGE).routing_key("fanout")],
        consumers: vec![
            ConsumerDefinition::new("Q1", AckDecision::Ack),
            ConsumerDefinition::new("Q2", AckDecision::NackDiscard),
        ],
    }
}

/// Headers exchange with an `all` and an `any` predicate.
pub fn headers() -> FlowDefinition {
    FlowDefinition {
        name: "HeaderExchange-normalQueue".to_owned(),
        exchange: ExchangeDefinition::new("HeaderExchange-normalQueue").headers(),
        queues: vec![
            QueueDefinition::new("HQ1").header_match(HeaderMatch::all().pair("a", "b").pair("c", "d")),
            QueueDefinition::new("HQ2").header_match(HeaderMatch::any().pair("a", "b")),
        ],
        dead_letter: None,
        publications: vec![Publication::new(SEED_MESSAGE).header("a", "b").header("c", "d")],
        consumers: vec![
            ConsumerDefinition::new("HQ1", AckDecision::Ack),
            ConsumerDefinition::new("HQ2", AckDecision::NackDiscard),
        ],
    }
}

/// The four built-in flows, one per routing discipline.
pub fn builtin_flows() -> Vec<FlowDefinition> {
    vec![direct(), topic(), fanout(), headers()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::GatewayError,
        exchange::ExchangeKind,
        gateway::MockBrokerGateway,
        memory::InMemoryBroker,
        queue::MatchSpec,
    };

    #[test]
    fn builtin_flows_have_valid_topologies() {
        for def in builtin_flows() {
            let manager = def.topology().unwrap();
            assert_eq!(
                manager.topology().exchange(def.exchange.name()).map(|e| e.exchange_kind()),
                Some(def.exchange.exchange_kind())
            );
            for consumer in &def.consumers {
                assert!(manager.topology().queue(&consumer.queue).is_some(), "{}", consumer.queue);
            }
        }
    }

    #[test]
    fn topic_flow_declares_a_quorum_queue() {
        let manager = topic().topology().unwrap();
        let order = manager.topology().queue("orderQ").unwrap();
        assert!(order.is_quorum());
        assert!(order.is_durable());
        assert_eq!(order.match_spec(), MatchSpec::Key("*.Order.*".into()));
    }

    #[test]
    fn dead_letter_queue_must_point_at_a_declared_exchange() {
        let mut def = direct();
        def.dead_letter = None;

        assert_eq!(
            def.topology().err(),
            Some(TopologyError::UnknownExchange("DeadExchange".into()))
        );
    }

    #[test]
    fn dead_letter_key_must_reach_the_dead_letter_queue() {
        let mut def = direct();
        if let Some(dl) = def.dead_letter.as_mut() {
            dl.queue = QueueDefinition::new("dead-q").binding_key("elsewhere");
        }

        assert_eq!(
            def.topology().err(),
            Some(TopologyError::UnroutableDeadLetter(
                "normalQ2".into(),
                "DeadExchange".into(),
                "dq".into()
            ))
        );
    }

    #[test]
    fn headers_binding_on_direct_exchange_is_rejected() {
        let mut def = headers();
        def.exchange = def.exchange.kind(ExchangeKind::Direct);

        assert!(matches!(
            def.topology(),
            Err(TopologyError::InvalidMatchSpec(..))
        ));
    }

    #[test]
    fn flow_definition_loads_from_json() {
        let def: FlowDefinition = serde_json::from_str(
            r#"{
                "name": "orders",
                "exchange": {"name": "orders", "type": "topic"},
                "queues": [{"name": "eu", "binding_key": "eu.#"}],
                "publications": [{"routing_key": "eu.fr", "body": "hi"}],
                "consumers": [{"queue": "eu", "decision": "nack_requeue"}]
            }"#,
        )
        .unwrap();

        assert_eq!(def.exchange.exchange_kind(), ExchangeKind::Topic);
        assert!(def.queues[0].is_durable());
        assert_eq!(def.consumers[0].decision, AckDecision::NackRequeue);
        assert!(def.dead_letter.is_none());
    }

    #[test]
    fn publication_builds_a_text_message() {
        let message = Publication::new("hi").routing_key("k").header("a", "b").to_message();
        assert_eq!(message.key(), Some("k"));
        assert_eq!(message.get_content_type(), TEXT_CONTENT_TYPE);
        assert_eq!(message.header_map().get("a").map(String::as_str), Some("b"));
    }

    #[tokio::test]
    async fn setup_installs_and_seeds_the_direct_flow() {
        let broker = Arc::new(InMemoryBroker::new());
        let flow = Flow::setup(direct(), broker.clone()).await.unwrap();

        let outcomes = flow.publish_all().await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(broker.depth("normalQ1"), 1);
        assert_eq!(broker.depth("normalQ2"), 1);
        assert_eq!(broker.depth("dead-q"), 0);
    }

    #[tokio::test]
    async fn gateway_failure_during_setup_ends_the_flow() {
        let mut gateway = MockBrokerGateway::new();
        gateway
            .expect_declare_exchange()
            .returning(|def| Err(GatewayError::DeclareExchangeError(def.name().to_owned())));

        let result = Flow::setup(fanout(), Arc::new(gateway)).await;
        assert_eq!(
            result.err(),
            Some(FlowError::Gateway(GatewayError::DeclareExchangeError(
                "FanoutExchange-normalQueue".into()
            )))
        );
    }

    #[tokio::test]
    async fn broken_flow_does_not_stop_the_others() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut broken = fanout();
        broken.name = "broken".into();
        broken.queues[0] = QueueDefinition::new("Q1").dead_letter("nowhere", "x");

        let (tx, rx) = watch::channel(false);
        let watcher = broker.clone();
        tokio::spawn(async move {
            // one message lands in both header queues
            while watcher.settled_count() < 2 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
            let _ = tx.send(true);
        });

        let results = run_flows(
            vec![broken, headers()],
            broker.clone(),
            RedeliveryPolicy::default(),
            rx,
        )
        .await;

        assert_eq!(results[0].0, "broken");
        assert!(matches!(results[0].1, Err(FlowError::Topology(..))));

        let stats = results[1].1.as_ref().unwrap();
        assert_eq!(stats["HQ1-consumer"].acked, 1);
        assert_eq!(stats["HQ2-consumer"].discarded, 1);
    }
}
