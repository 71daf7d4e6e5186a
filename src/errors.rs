// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! Errors are split by the layer that raises them: topology consistency
//! violations, publish-time caller errors, transport failures coming back from a
//! broker gateway, and failures reported by consumer handlers. `FlowError` is the
//! umbrella type returned when a whole flow is set up or driven.

use crate::message::AckDecision;
use thiserror::Error;

/// Declaration and binding consistency violations.
///
/// These are fatal to the flow whose topology is being built but never to the
/// process.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// An exchange was referenced before it was declared
    #[error("exchange `{0}` was not declared")]
    UnknownExchange(String),

    /// A queue was referenced before it was declared
    #[error("queue `{0}` was not declared")]
    UnknownQueue(String),

    /// An exchange was redeclared with a different type or durability
    #[error("exchange `{0}` already declared with different parameters")]
    ExchangeConflict(String),

    /// A queue was redeclared with different durability, quorum or dead-letter target
    #[error("queue `{0}` already declared with different parameters")]
    QueueConflict(String),

    /// The queue parameters are not valid on their own
    #[error("invalid queue `{0}`: {1}")]
    InvalidQueue(String, String),

    /// The (exchange, queue) pair is already bound with another match spec
    #[error("queue `{1}` already bound to exchange `{0}` with a different match spec")]
    BindingConflict(String, String),

    /// The match spec does not fit the exchange type
    #[error("invalid match spec binding queue `{1}` to exchange `{0}`: {2}")]
    InvalidMatchSpec(String, String, String),

    /// No queue is bound to the dead-letter exchange under the dead-letter key
    #[error("dead-letter target of queue `{0}` reaches no queue on exchange `{1}` with key `{2}`")]
    UnroutableDeadLetter(String, String, String),
}

/// Errors returned by [`crate::publisher::Publisher::publish`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The target exchange is not part of the declared topology
    #[error("unknown exchange `{0}`")]
    UnknownExchange(String),

    /// The gateway failed to accept the message
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Transport-level failures reported by a broker gateway.
///
/// The core never retries these itself; they are propagated to the caller
/// wrapping the flow.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Error establishing a connection to the broker
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message to the given exchange
    #[error("failure to publish to `{0}`")]
    PublishingError(String),

    /// Error creating a consumer on the given queue
    #[error("failure to declare consumer `{0}`")]
    ConsumerError(String),

    /// Error acknowledging a delivery
    #[error("failure to ack message `{0}`")]
    AckMessageError(u64),

    /// Error negative-acknowledging a delivery
    #[error("failure to nack message `{0}`")]
    NackMessageError(u64),

    /// The delivery tag is not in flight: never delivered or already settled
    #[error("unknown delivery tag `{0}`")]
    UnknownDeliveryTag(u64),

    /// The queue does not exist on the broker
    #[error("unknown queue `{0}`")]
    UnknownQueue(String),

    /// The broker refused a redeclaration or binding
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
}

/// Failures surfaced by a consumer handler.
///
/// A handler error is never left unresolved: it always maps onto one of the
/// acknowledgment decisions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The message could be processed later
    #[error("transient failure: {0}")]
    Transient(String),

    /// The message can never be processed
    #[error("message rejected: {0}")]
    Rejected(String),
}

impl HandlerError {
    /// The acknowledgment decision this failure resolves to.
    pub fn decision(&self) -> AckDecision {
        match self {
            HandlerError::Transient(_) => AckDecision::NackRequeue,
            HandlerError::Rejected(_) => AckDecision::NackDiscard,
        }
    }
}

/// Errors that terminate a single flow.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    #[error("flow `{0}` topology error: {1}")]
    Topology(String, TopologyError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// A consumer task ended abnormally
    #[error("consumer task failure: {0}")]
    InternalError(String),
}

/// Errors loading the application configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing environment variable `{0}`")]
    MissingVar(&'static str),

    #[error("invalid value for `{0}`: {1}")]
    InvalidValue(&'static str, String),

    #[error("failure to read config file `{0}`: {1}")]
    Io(String, #[source] std::io::Error),

    #[error("failure to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}
