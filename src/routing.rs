// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Routing Engine
//!
//! Decides which queues a message published to an exchange reaches. Each binding
//! carries a [`Matcher`] compiled once, when the binding is created, from the
//! exchange type and the binding's match spec. Routing is then a pure function
//! of the bindings and the message: no hidden state and no randomness.

use crate::{
    errors::TopologyError,
    exchange::{ExchangeDefinition, ExchangeKind},
    message::Message,
    queue::{HeaderMatch, MatchSpec},
};
use std::collections::BTreeSet;

/// One segment of a topic pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Word(String),
    /// `*`: exactly one word
    Star,
    /// `#`: zero or more words
    Hash,
}

/// A parsed dot-delimited topic pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    segments: Vec<Segment>,
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> TopicPattern {
        let mut segments: Vec<Segment> = Vec::new();

        for word in pattern.split('.') {
            let segment = match word {
                "*" => Segment::Star,
                "#" => Segment::Hash,
                w => Segment::Word(w.to_owned()),
            };

            // consecutive `#` are equivalent to a single one
            if segment == Segment::Hash && segments.last() == Some(&Segment::Hash) {
                continue;
            }
            segments.push(segment);
        }

        TopicPattern { segments }
    }

    pub fn matches(&self, routing_key: &str) -> bool {
        let words: Vec<&str> = routing_key.split('.').collect();
        match_segments(&self.segments, &words)
    }
}

/// Matches pattern suffixes against word suffixes bottom-up, one table row per
/// segment, so a pattern with many `#` stays linear in the number of words.
fn match_segments(pattern: &[Segment], words: &[&str]) -> bool {
    let n = words.len();
    // next[j]: pattern[i + 1..] matches words[j..]
    let mut next = vec![false; n + 1];
    next[n] = true;

    for segment in pattern.iter().rev() {
        let mut row = vec![false; n + 1];
        for j in (0..=n).rev() {
            row[j] = match segment {
                Segment::Hash => next[j] || (j < n && row[j + 1]),
                Segment::Star => j < n && next[j + 1],
                Segment::Word(w) => j < n && words[j] == w.as_str() && next[j + 1],
            };
        }
        next = row;
    }

    next[0]
}

/// Routing rule of a single binding, specialised for its exchange type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    Exact(String),
    Pattern(TopicPattern),
    Everything,
    Headers(HeaderMatch),
}

impl Matcher {
    /// Compiles the match spec of a binding for the given exchange type.
    pub fn compile(
        exchange: &ExchangeDefinition,
        queue: &str,
        spec: &MatchSpec,
    ) -> Result<Matcher, TopologyError> {
        let invalid = |reason: &str| {
            TopologyError::InvalidMatchSpec(
                exchange.name().to_owned(),
                queue.to_owned(),
                reason.to_owned(),
            )
        };

        match (exchange.exchange_kind(), spec) {
            (ExchangeKind::Fanout, _) => Ok(Matcher::Everything),
            (ExchangeKind::Direct, MatchSpec::Key(key)) => Ok(Matcher::Exact(key.clone())),
            (ExchangeKind::Direct, MatchSpec::None) => Ok(Matcher::Exact(String::new())),
            (ExchangeKind::Topic, MatchSpec::Key(key)) => {
                Ok(Matcher::Pattern(TopicPattern::parse(key)))
            }
            (ExchangeKind::Topic, MatchSpec::None) => Ok(Matcher::Pattern(TopicPattern::parse(""))),
            (ExchangeKind::Headers, MatchSpec::Headers(hm)) => Ok(Matcher::Headers(hm.clone())),
            (ExchangeKind::Headers, MatchSpec::None) => Ok(Matcher::Headers(HeaderMatch::all())),
            (ExchangeKind::Direct | ExchangeKind::Topic, MatchSpec::Headers(_)) => {
                Err(invalid("header predicate on a key based exchange"))
            }
            (ExchangeKind::Headers, MatchSpec::Key(_)) => {
                Err(invalid("routing key on a headers exchange"))
            }
        }
    }

    pub fn matches(&self, message: &Message) -> bool {
        match self {
            Matcher::Exact(key) => key == message.effective_key(),
            Matcher::Pattern(pattern) => pattern.matches(message.effective_key()),
            Matcher::Everything => true,
            Matcher::Headers(hm) => hm.matches(message.header_map()),
        }
    }
}

/// A queue bound to an exchange with its compiled matcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub exchange: String,
    pub queue: String,
    pub spec: MatchSpec,
    pub(crate) matcher: Matcher,
}

impl Binding {
    pub fn new(
        exchange: &ExchangeDefinition,
        queue: &str,
        spec: MatchSpec,
    ) -> Result<Binding, TopologyError> {
        let matcher = Matcher::compile(exchange, queue, &spec)?;
        Ok(Binding {
            exchange: exchange.name().to_owned(),
            queue: queue.to_owned(),
            spec,
            matcher,
        })
    }

    pub fn matches(&self, message: &Message) -> bool {
        self.matcher.matches(message)
    }
}

/// Computes the set of queues a message published to `exchange` reaches.
///
/// Bindings belonging to other exchanges are ignored. An empty set is a valid
/// answer: the message is unroutable.
pub fn route(exchange: &ExchangeDefinition, bindings: &[Binding], message: &Message) -> BTreeSet<String> {
    bindings
        .iter()
        .filter(|b| b.exchange == exchange.name() && b.matches(message))
        .map(|b| b.queue.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bind(exchange: &ExchangeDefinition, queue: &str, spec: MatchSpec) -> Binding {
        Binding::new(exchange, queue, spec).unwrap()
    }

    fn key(k: &str) -> MatchSpec {
        MatchSpec::Key(k.to_owned())
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn direct_routes_on_exact_key() {
        let ex = ExchangeDefinition::new("E").direct();
        let bindings = vec![bind(&ex, "q1", key("a")), bind(&ex, "q2", key("b"))];

        assert_eq!(route(&ex, &bindings, &Message::new("m").routing_key("a")), set(&["q1"]));
        assert_eq!(route(&ex, &bindings, &Message::new("m").routing_key("b")), set(&["q2"]));
        assert!(route(&ex, &bindings, &Message::new("m").routing_key("c")).is_empty());
        assert!(route(&ex, &bindings, &Message::new("m").routing_key("A")).is_empty());
    }

    #[test]
    fn direct_delivers_to_every_queue_sharing_a_key() {
        let ex = ExchangeDefinition::new("E").direct();
        let bindings = vec![bind(&ex, "q1", key("a")), bind(&ex, "q2", key("a"))];
        assert_eq!(
            route(&ex, &bindings, &Message::new("m").routing_key("a")),
            set(&["q1", "q2"])
        );
    }

    #[test]
    fn route_ignores_other_exchanges() {
        let ex = ExchangeDefinition::new("E").direct();
        let other = ExchangeDefinition::new("F").direct();
        let bindings = vec![bind(&ex, "q1", key("a")), bind(&other, "q2", key("a"))];
        assert_eq!(
            route(&ex, &bindings, &Message::new("m").routing_key("a")),
            set(&["q1"])
        );
    }

    #[test]
    fn topic_star_matches_exactly_one_word() {
        let p = TopicPattern::parse("*.Order.*");
        assert!(p.matches("a.Order.b"));
        assert!(!p.matches("a.b.Order.c"));
        assert!(!p.matches("Order.b"));
        assert!(!p.matches("a.Order"));
        assert!(!p.matches("a.order.b"));
    }

    #[test]
    fn topic_hash_matches_zero_or_more_words() {
        let p = TopicPattern::parse("pay.#");
        assert!(p.matches("pay"));
        assert!(p.matches("pay.from"));
        assert!(p.matches("pay.from.atm"));
        assert!(!p.matches("payment.from"));

        let p = TopicPattern::parse("#.atm");
        assert!(p.matches("atm"));
        assert!(p.matches("pay.from.atm"));
        assert!(!p.matches("pay.atm.x"));

        let p = TopicPattern::parse("a.#.z");
        assert!(p.matches("a.z"));
        assert!(p.matches("a.b.c.z"));
        assert!(!p.matches("a.b.c"));

        assert!(TopicPattern::parse("#").matches(""));
        assert!(TopicPattern::parse("#").matches("any.thing.at.all"));
        assert!(TopicPattern::parse("#.#").matches("x"));
    }

    #[test]
    fn topic_backtracks_over_hash() {
        let p = TopicPattern::parse("#.b.*");
        assert!(p.matches("b.x"));
        assert!(p.matches("a.b.b.x"));
        assert!(!p.matches("a.b"));
    }

    #[test]
    fn topic_with_many_hashes_fails_fast() {
        let p = TopicPattern::parse("#.a.#.a.#.a.#.a.#.a.#.b");
        let key = vec!["a"; 200].join(".");

        let started = std::time::Instant::now();
        assert!(!p.matches(&key));
        assert!(p.matches(&format!("{key}.b")));
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
    }

    #[test]
    fn topic_exchange_routing() {
        let ex = ExchangeDefinition::new("T").topic();
        let bindings = vec![
            bind(&ex, "orderQ", key("*.Order.*")),
            bind(&ex, "payQ", key("pay.#")),
        ];
        assert_eq!(
            route(&ex, &bindings, &Message::new("m").routing_key("a.Order.b")),
            set(&["orderQ"])
        );
        assert_eq!(
            route(&ex, &bindings, &Message::new("m").routing_key("pay.from.atm")),
            set(&["payQ"])
        );
        assert!(route(&ex, &bindings, &Message::new("m").routing_key("a.b.Order.c")).is_empty());
    }

    #[test]
    fn fanout_ignores_routing_key_and_spec() {
        let ex = ExchangeDefinition::new("F").fanout();
        let bindings = vec![bind(&ex, "q1", key("fanout")), bind(&ex, "q2", MatchSpec::None)];

        for msg in [
            Message::new("m"),
            Message::new("m").routing_key("fanout"),
            Message::new("m").routing_key("whatever.else"),
        ] {
            assert_eq!(route(&ex, &bindings, &msg), set(&["q1", "q2"]));
        }
    }

    #[test]
    fn headers_exchange_routing() {
        let ex = ExchangeDefinition::new("H").headers();
        let bindings = vec![
            bind(
                &ex,
                "HQ1",
                MatchSpec::Headers(HeaderMatch::all().pair("a", "b").pair("c", "d")),
            ),
            bind(&ex, "HQ2", MatchSpec::Headers(HeaderMatch::any().pair("a", "b"))),
        ];

        let full = Message::new("m").header("a", "b").header("c", "d").header("e", "f");
        assert_eq!(route(&ex, &bindings, &full), set(&["HQ1", "HQ2"]));

        let partial = Message::new("m").header("a", "b").header("z", "y");
        assert_eq!(route(&ex, &bindings, &partial), set(&["HQ2"]));

        assert!(route(&ex, &bindings, &Message::new("m").routing_key("a")).is_empty());
    }

    #[test]
    fn rejects_spec_not_fitting_exchange() {
        let direct = ExchangeDefinition::new("D").direct();
        let headers = ExchangeDefinition::new("H").headers();

        assert!(matches!(
            Binding::new(&direct, "q", MatchSpec::Headers(HeaderMatch::all())),
            Err(TopologyError::InvalidMatchSpec(..))
        ));
        assert!(matches!(
            Binding::new(&headers, "q", key("k")),
            Err(TopologyError::InvalidMatchSpec(..))
        ));
    }

    #[test]
    fn routing_is_deterministic() {
        let ex = ExchangeDefinition::new("T").topic();
        let bindings = vec![bind(&ex, "a", key("#")), bind(&ex, "b", key("x.*"))];
        let msg = Message::new("m").routing_key("x.y");
        let first = route(&ex, &bindings, &msg);
        for _ in 0..10 {
            assert_eq!(route(&ex, &bindings, &msg), first);
        }
    }
}
