// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatcher
//!
//! Runs one [`DeliveryLoop`] per registered queue, all in parallel. Loops share
//! only the read-only topology and the gateway. A single cancellation signal
//! fans out to every loop; when one loop fails, its siblings are cancelled too,
//! so a broken flow shuts down as a whole.

use crate::{
    consumer::{ConsumerHandler, DeliveryLoop, LoopStats, RedeliveryPolicy},
    errors::{FlowError, TopologyError},
    gateway::BrokerGateway,
    publisher::Publisher,
};
use futures_util::{stream::FuturesUnordered, StreamExt};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::watch;
use tracing::{debug, error};

/// Associates a queue and consumer tag with a handler.
#[derive(Clone)]
pub struct DispatcherDefinition {
    pub(crate) queue: String,
    pub(crate) consumer_tag: String,
    pub(crate) handler: Arc<dyn ConsumerHandler>,
}

/// Manages the delivery loops of one flow.
pub struct Dispatcher {
    gateway: Arc<dyn BrokerGateway>,
    publisher: Arc<Publisher>,
    policy: RedeliveryPolicy,
    pub(crate) dispatchers_def: Vec<DispatcherDefinition>,
}

impl Dispatcher {
    pub fn new(
        gateway: Arc<dyn BrokerGateway>,
        publisher: Arc<Publisher>,
        policy: RedeliveryPolicy,
    ) -> Self {
        Dispatcher {
            gateway,
            publisher,
            policy,
            dispatchers_def: vec![],
        }
    }

    /// Registers a handler for a queue under the consumer tag `<queue>-consumer`.
    pub fn register(self, queue: &str, handler: Arc<dyn ConsumerHandler>) -> Self {
        let tag = format!("{queue}-consumer");
        self.register_tagged(queue, &tag, handler)
    }

    /// Registers a handler for a queue under an explicit consumer tag.
    pub fn register_tagged(mut self, queue: &str, consumer_tag: &str, handler: Arc<dyn ConsumerHandler>) -> Self {
        self.dispatchers_def.push(DispatcherDefinition {
            queue: queue.to_owned(),
            consumer_tag: consumer_tag.to_owned(),
            handler,
        });
        self
    }

    /// Consumes every registered queue until `shutdown` is signalled or a loop fails.
    ///
    /// Returns the settlement counters per consumer tag, or the first error.
    pub async fn consume_blocking(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<BTreeMap<String, LoopStats>, FlowError> {
        let mut loops = Vec::with_capacity(self.dispatchers_def.len());
        for def in &self.dispatchers_def {
            let Some(queue) = self.publisher.topology().queue(&def.queue).cloned() else {
                error!(queue = def.queue.as_str(), "consumer registered on an undeclared queue");
                return Err(FlowError::Topology(
                    def.consumer_tag.clone(),
                    TopologyError::UnknownQueue(def.queue.clone()),
                ));
            };

            loops.push((
                def.consumer_tag.clone(),
                DeliveryLoop::new(
                    queue,
                    &def.consumer_tag,
                    self.gateway.clone(),
                    self.publisher.clone(),
                    def.handler.clone(),
                    self.policy,
                ),
            ));
        }

        let (flow_tx, flow_rx) = watch::channel(*shutdown.borrow());
        let mut spawns = FuturesUnordered::new();
        for (tag, delivery_loop) in loops {
            let rx = flow_rx.clone();
            spawns.push(async move { (tag, tokio::spawn(delivery_loop.run(rx)).await) });
        }

        let mut stats = BTreeMap::new();
        let mut first_err = None;
        let mut stopping = false;

        loop {
            tokio::select! {
                finished = spawns.next() => {
                    let Some((tag, joined)) = finished else {
                        break;
                    };

                    match joined {
                        Ok(Ok(loop_stats)) => {
                            debug!(consumer_tag = tag.as_str(), ?loop_stats, "consumer finished");
                            stats.insert(tag, loop_stats);
                        }
                        Ok(Err(err)) => {
                            error!(error = err.to_string(), consumer_tag = tag.as_str(), "consumer failure");
                            first_err.get_or_insert(FlowError::Gateway(err));
                            let _ = flow_tx.send(true);
                        }
                        Err(err) => {
                            error!(error = err.to_string(), "tokio process error");
                            first_err.get_or_insert(FlowError::InternalError(err.to_string()));
                            let _ = flow_tx.send(true);
                        }
                    }
                }
                changed = shutdown.changed(), if !stopping => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("stopping consumers");
                        stopping = true;
                        let _ = flow_tx.send(true);
                    }
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(stats),
        }
    }
}
