// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! This module provides types for defining queues and the bindings that attach
//! them to exchanges. A queue may carry a dead-letter target that receives its
//! negatively acknowledged, non-requeued messages, and may be declared as a
//! quorum queue.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a header predicate combines its pairs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Every pair must be present with an equal value
    #[default]
    All,
    /// At least one pair must be present with an equal value
    Any,
}

impl MatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMode::All => "all",
            MatchMode::Any => "any",
        }
    }
}

/// Header predicate used by Headers exchanges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderMatch {
    #[serde(default)]
    pub mode: MatchMode,
    #[serde(default)]
    pub pairs: BTreeMap<String, String>,
}

impl HeaderMatch {
    pub fn all() -> Self {
        HeaderMatch {
            mode: MatchMode::All,
            pairs: BTreeMap::default(),
        }
    }

    pub fn any() -> Self {
        HeaderMatch {
            mode: MatchMode::Any,
            pairs: BTreeMap::default(),
        }
    }

    pub fn pair(mut self, key: &str, value: &str) -> Self {
        self.pairs.insert(key.to_owned(), value.to_owned());
        self
    }

    /// Evaluates the predicate against a set of message headers.
    ///
    /// `All` with no pairs is vacuously true; `Any` with no pairs never matches.
    pub fn matches(&self, headers: &BTreeMap<String, String>) -> bool {
        let hit = |(k, v): (&String, &String)| headers.get(k) == Some(v);
        match self.mode {
            MatchMode::All => self.pairs.iter().all(hit),
            MatchMode::Any => self.pairs.iter().any(hit),
        }
    }
}

/// Exchange and routing key a queue forwards discarded messages to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeadLetterTarget {
    pub exchange: String,
    #[serde(default)]
    pub routing_key: String,
}

impl DeadLetterTarget {
    pub fn new(exchange: &str, routing_key: &str) -> Self {
        DeadLetterTarget {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        }
    }
}

/// The rule a binding uses to select messages.
///
/// Which variant is valid depends on the exchange type: `Key` for Direct and
/// Topic (exact key or wildcard pattern), `Headers` for Headers, anything for
/// Fanout where the spec is ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchSpec {
    #[default]
    None,
    Key(String),
    Headers(HeaderMatch),
}

fn default_durable() -> bool {
    true
}

/// Definition of a queue with its configuration parameters.
///
/// Identity is the name. Queues are durable by default, as every queue in the
/// provisioned flows survives broker restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDefinition {
    pub(crate) name: String,
    #[serde(default = "default_durable")]
    pub(crate) durable: bool,
    #[serde(default)]
    pub(crate) quorum: bool,
    #[serde(default)]
    pub(crate) exclusive: bool,
    #[serde(default)]
    pub(crate) delete: bool,
    #[serde(default)]
    pub(crate) binding_key: Option<String>,
    #[serde(default)]
    pub(crate) header_match: Option<HeaderMatch>,
    #[serde(default)]
    pub(crate) dead_letter: Option<DeadLetterTarget>,
}

impl QueueDefinition {
    /// Creates a new durable, classic queue definition with the given name.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: true,
            quorum: false,
            exclusive: false,
            delete: false,
            binding_key: None,
            header_match: None,
            dead_letter: None,
        }
    }

    /// Makes the queue non-durable.
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Declares the queue as a replicated quorum queue. Quorum queues are always durable.
    pub fn quorum(mut self) -> Self {
        self.quorum = true;
        self.durable = true;
        self
    }

    /// Makes the queue exclusive to the declaring connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the queue to auto-delete when its last consumer goes away.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Key (Direct) or pattern (Topic) used when binding to the flow's exchange.
    pub fn binding_key(mut self, key: &str) -> Self {
        self.binding_key = Some(key.to_owned());
        self
    }

    /// Header predicate used when binding to a Headers exchange.
    pub fn header_match(mut self, header_match: HeaderMatch) -> Self {
        self.header_match = Some(header_match);
        self
    }

    /// Forwards discarded messages to the given exchange and routing key.
    pub fn dead_letter(mut self, exchange: &str, routing_key: &str) -> Self {
        self.dead_letter = Some(DeadLetterTarget::new(exchange, routing_key));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_quorum(&self) -> bool {
        self.quorum
    }

    pub fn dead_letter_target(&self) -> Option<&DeadLetterTarget> {
        self.dead_letter.as_ref()
    }

    /// The match spec this queue binds with, derived from its header match or binding key.
    pub fn match_spec(&self) -> MatchSpec {
        if let Some(header_match) = &self.header_match {
            return MatchSpec::Headers(header_match.clone());
        }

        match &self.binding_key {
            Some(key) => MatchSpec::Key(key.clone()),
            None => MatchSpec::None,
        }
    }

    /// Whether `other` may be declared over `self` without a conflict.
    pub(crate) fn compatible_with(&self, other: &QueueDefinition) -> bool {
        self.durable == other.durable
            && self.quorum == other.quorum
            && self.dead_letter == other.dead_letter
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    #[serde(default)]
    pub(crate) spec: MatchSpec,
}

impl QueueBinding {
    /// Creates a new binding for the given queue with an empty exchange and no match spec.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            spec: MatchSpec::None,
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the binding key (Direct) or pattern (Topic).
    pub fn routing_key(mut self, key: &str) -> Self {
        self.spec = MatchSpec::Key(key.to_owned());
        self
    }

    /// Sets the header predicate (Headers).
    pub fn headers(mut self, header_match: HeaderMatch) -> Self {
        self.spec = MatchSpec::Headers(header_match);
        self
    }

    pub fn spec(mut self, spec: MatchSpec) -> Self {
        self.spec = spec;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn match_spec(&self) -> &MatchSpec {
        &self.spec
    }

    /// The routing key sent to the broker on bind; empty for header predicates.
    pub(crate) fn broker_routing_key(&self) -> &str {
        match &self.spec {
            MatchSpec::Key(key) => key,
            _ => "",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn all_mode_requires_every_pair() {
        let hm = HeaderMatch::all().pair("a", "b").pair("c", "d");
        assert!(hm.matches(&headers(&[("a", "b"), ("c", "d"), ("e", "f")])));
        assert!(!hm.matches(&headers(&[("a", "b")])));
        assert!(!hm.matches(&headers(&[("a", "b"), ("c", "x")])));
    }

    #[test]
    fn any_mode_requires_one_pair() {
        let hm = HeaderMatch::any().pair("a", "b");
        assert!(hm.matches(&headers(&[("a", "b"), ("z", "y")])));
        assert!(!hm.matches(&headers(&[("a", "c")])));
    }

    #[test]
    fn empty_predicates() {
        assert!(HeaderMatch::all().matches(&BTreeMap::new()));
        assert!(!HeaderMatch::any().matches(&headers(&[("a", "b")])));
    }

    #[test]
    fn quorum_forces_durable() {
        let q = QueueDefinition::new("orderQ").transient().quorum();
        assert!(q.is_durable());
        assert!(q.is_quorum());
    }

    #[test]
    fn match_spec_prefers_headers() {
        let q = QueueDefinition::new("q")
            .binding_key("k")
            .header_match(HeaderMatch::any().pair("a", "b"));
        assert_eq!(
            q.match_spec(),
            MatchSpec::Headers(HeaderMatch::any().pair("a", "b"))
        );
        assert_eq!(
            QueueDefinition::new("q").binding_key("k").match_spec(),
            MatchSpec::Key("k".into())
        );
        assert_eq!(QueueDefinition::new("q").match_spec(), MatchSpec::None);
    }

    #[test]
    fn compatibility_checks_dead_letter_target() {
        let q = QueueDefinition::new("q2").dead_letter("DeadExchange", "dq");
        assert!(q.compatible_with(&q.clone().binding_key("other")));
        assert!(!q.compatible_with(&QueueDefinition::new("q2")));
        assert!(!q.compatible_with(&q.clone().transient()));
    }
}
