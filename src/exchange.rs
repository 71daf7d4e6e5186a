// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Exchanges are the routing nodes messages are published to. The exchange type
//! is a closed set; each variant has exactly one routing rule, which is compiled
//! into a [`crate::routing::Matcher`] when a queue is bound, so publishing never
//! re-dispatches on type names.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents the routing disciplines supported by an exchange.
///
/// - Direct: exact match between binding key and routing key
/// - Topic: dot-separated wildcard patterns (`*` one word, `#` zero or more)
/// - Fanout: every bound queue, routing key ignored
/// - Headers: predicate over message headers (`all` or `any` pairs)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Topic,
    Fanout,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

fn default_durable() -> bool {
    true
}

/// Definition of an exchange. Identity is the name; immutable once declared.
///
/// Exchanges are durable unless [`ExchangeDefinition::transient`] is used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    #[serde(default, rename = "type")]
    pub(crate) kind: ExchangeKind,
    #[serde(default = "default_durable")]
    pub(crate) durable: bool,
    #[serde(default)]
    pub(crate) delete: bool,
    #[serde(default)]
    pub(crate) internal: bool,
}

impl ExchangeDefinition {
    /// Creates a new durable Direct exchange definition with the given name.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            durable: true,
            delete: false,
            internal: false,
        }
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn direct(self) -> Self {
        self.kind(ExchangeKind::Direct)
    }

    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    pub fn headers(self) -> Self {
        self.kind(ExchangeKind::Headers)
    }

    /// Makes the exchange non-durable; it will not survive a broker restart.
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing by clients.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange_kind(&self) -> ExchangeKind {
        self.kind
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Whether `other` may be declared over `self` without a conflict.
    pub(crate) fn compatible_with(&self, other: &ExchangeDefinition) -> bool {
        self.kind == other.kind && self.durable == other.durable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_to_durable_direct() {
        let def = ExchangeDefinition::new("orders");
        assert_eq!(def.exchange_kind(), ExchangeKind::Direct);
        assert!(def.is_durable());
    }

    #[test]
    fn compatibility_ignores_auto_delete_but_not_type() {
        let a = ExchangeDefinition::new("ex").topic();
        assert!(a.compatible_with(&a.clone().delete()));
        assert!(!a.compatible_with(&a.clone().fanout()));
        assert!(!a.compatible_with(&a.clone().transient()));
    }

    #[test]
    fn deserializes_lowercase_type() {
        let def: ExchangeDefinition =
            serde_json::from_str(r#"{"name":"h","type":"headers"}"#).unwrap();
        assert_eq!(def.exchange_kind(), ExchangeKind::Headers);
        assert!(def.is_durable());
    }
}
