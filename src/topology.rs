// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! This module keeps the in-memory topology graph: exchanges, queues and the
//! bindings between them. Declarations are idempotent and validated in
//! dependency order. Nothing reaches a broker until [`TopologyManager::install`]
//! is called, so the graph can be built and checked without a live connection.
//!
//! The main components are:
//! - `TopologyManager`: declaration and binding with consistency checks
//! - `Topology`: the read-only snapshot shared by publishers and consumers

use crate::{
    errors::{GatewayError, TopologyError},
    exchange::{ExchangeDefinition, ExchangeKind},
    gateway::BrokerGateway,
    message::Message,
    queue::{MatchSpec, QueueBinding, QueueDefinition},
    routing::{self, Binding},
};
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};
use tracing::{debug, error};

/// Read-only view of a declared topology.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueDefinition>,
    bindings: Vec<Binding>,
}

impl Topology {
    pub fn exchange(&self, name: &str) -> Option<&ExchangeDefinition> {
        self.exchanges.get(name)
    }

    pub fn queue(&self, name: &str) -> Option<&QueueDefinition> {
        self.queues.get(name)
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// Resolves the queues a message published to `exchange` reaches.
    pub fn route(&self, exchange: &str, message: &Message) -> Result<BTreeSet<String>, TopologyError> {
        let Some(def) = self.exchanges.get(exchange) else {
            return Err(TopologyError::UnknownExchange(exchange.to_owned()));
        };

        Ok(routing::route(def, &self.bindings, message))
    }
}

/// Builds a [`Topology`] with idempotent, validated declarations.
#[derive(Debug, Default)]
pub struct TopologyManager {
    topology: Topology,
    // declaration order, replayed by `install`
    exchange_order: Vec<String>,
    queue_order: Vec<String>,
}

impl TopologyManager {
    pub fn new() -> TopologyManager {
        TopologyManager::default()
    }

    /// Registers an exchange.
    ///
    /// Redeclaring with the same type and durability is a no-op; anything else
    /// under the same name is a conflict.
    pub fn declare_exchange(&mut self, def: ExchangeDefinition) -> Result<(), TopologyError> {
        if let Some(existing) = self.topology.exchanges.get(def.name()) {
            if existing.compatible_with(&def) {
                debug!(name = def.name(), "exchange already declared");
                return Ok(());
            }

            error!(
                name = def.name(),
                existing = existing.exchange_kind().as_str(),
                requested = def.exchange_kind().as_str(),
                "conflicting exchange declaration"
            );
            return Err(TopologyError::ExchangeConflict(def.name().to_owned()));
        }

        debug!(name = def.name(), kind = def.exchange_kind().as_str(), "exchange declared");
        self.exchange_order.push(def.name().to_owned());
        self.topology.exchanges.insert(def.name().to_owned(), def);
        Ok(())
    }

    /// Registers a queue.
    ///
    /// A dead-letter exchange referenced by the queue must already be declared,
    /// and some queue must already be bound to it under the dead-letter key.
    /// Headers exchanges only need a binding: the headers a dead-lettered copy
    /// carries are not known until it is discarded.
    pub fn declare_queue(&mut self, def: QueueDefinition) -> Result<(), TopologyError> {
        if def.is_quorum() && !def.is_durable() {
            return Err(TopologyError::InvalidQueue(
                def.name().to_owned(),
                "quorum queues must be durable".to_owned(),
            ));
        }

        if let Some(target) = def.dead_letter_target() {
            if !self.topology.exchanges.contains_key(&target.exchange) {
                error!(
                    queue = def.name(),
                    exchange = target.exchange.as_str(),
                    "dead-letter exchange must be declared before the queue"
                );
                return Err(TopologyError::UnknownExchange(target.exchange.clone()));
            }

            if !self.dead_letter_routes(&target.exchange, &target.routing_key) {
                error!(
                    queue = def.name(),
                    exchange = target.exchange.as_str(),
                    routing_key = target.routing_key.as_str(),
                    "dead-letter target reaches no queue"
                );
                return Err(TopologyError::UnroutableDeadLetter(
                    def.name().to_owned(),
                    target.exchange.clone(),
                    target.routing_key.clone(),
                ));
            }
        }

        if let Some(existing) = self.topology.queues.get(def.name()) {
            if existing.compatible_with(&def) {
                debug!(name = def.name(), "queue already declared");
                return Ok(());
            }

            error!(name = def.name(), "conflicting queue declaration");
            return Err(TopologyError::QueueConflict(def.name().to_owned()));
        }

        debug!(name = def.name(), durable = def.is_durable(), "queue declared");
        self.queue_order.push(def.name().to_owned());
        self.topology.queues.insert(def.name().to_owned(), def);
        Ok(())
    }

    fn dead_letter_routes(&self, exchange: &str, routing_key: &str) -> bool {
        match self.topology.exchanges.get(exchange) {
            Some(def) if def.exchange_kind() == ExchangeKind::Headers => {
                self.topology.bindings.iter().any(|b| b.exchange == exchange)
            }
            Some(_) => self
                .topology
                .route(exchange, &Message::new("").routing_key(routing_key))
                .is_ok_and(|queues| !queues.is_empty()),
            None => false,
        }
    }

    /// Binds a queue to an exchange.
    ///
    /// Both sides must be declared. Each (exchange, queue) pair holds at most one
    /// match spec: rebinding with the same spec is a no-op, a different one is a
    /// conflict.
    pub fn bind(&mut self, exchange: &str, queue: &str, spec: MatchSpec) -> Result<(), TopologyError> {
        let Some(exchange_def) = self.topology.exchanges.get(exchange) else {
            return Err(TopologyError::UnknownExchange(exchange.to_owned()));
        };

        if !self.topology.queues.contains_key(queue) {
            return Err(TopologyError::UnknownQueue(queue.to_owned()));
        }

        if let Some(existing) = self
            .topology
            .bindings
            .iter()
            .find(|b| b.exchange == exchange && b.queue == queue)
        {
            if existing.spec == spec {
                debug!(exchange, queue, "binding already exists");
                return Ok(());
            }

            error!(exchange, queue, "conflicting binding");
            return Err(TopologyError::BindingConflict(
                exchange.to_owned(),
                queue.to_owned(),
            ));
        }

        let binding = Binding::new(exchange_def, queue, spec)?;
        debug!(exchange, queue, "queue bound");
        self.topology.bindings.push(binding);
        Ok(())
    }

    /// Binds using a [`QueueBinding`] description.
    pub fn queue_binding(&mut self, binding: &QueueBinding) -> Result<(), TopologyError> {
        self.bind(
            binding.exchange_name(),
            binding.queue_name(),
            binding.match_spec().clone(),
        )
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Shareable read-only snapshot of the current graph.
    pub fn snapshot(&self) -> Arc<Topology> {
        Arc::new(self.topology.clone())
    }

    /// Propagates the topology to a broker.
    ///
    /// This method performs the following operations in order:
    /// 1. Declares all exchanges
    /// 2. Declares each queue, with its dead-letter and quorum arguments,
    ///    followed by that queue's bindings
    ///
    /// Replaying queues in declaration order keeps every dead-letter target
    /// bound before the queues that reference it.
    pub async fn install(&self, gateway: &dyn BrokerGateway) -> Result<(), GatewayError> {
        for name in &self.exchange_order {
            if let Some(def) = self.topology.exchanges.get(name) {
                gateway.declare_exchange(def).await?;
            }
        }

        for name in &self.queue_order {
            let Some(def) = self.topology.queues.get(name) else {
                continue;
            };
            gateway.declare_queue(def).await?;

            for binding in self.topology.bindings.iter().filter(|b| &b.queue == name) {
                let queue_binding = QueueBinding::new(&binding.queue)
                    .exchange(&binding.exchange)
                    .spec(binding.spec.clone());
                gateway.bind(&queue_binding).await?;
            }
        }

        debug!("topology installed");
        Ok(())
    }
}
