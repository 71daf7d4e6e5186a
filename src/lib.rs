// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod amqp;
pub mod channel;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod flow;
pub mod gateway;
pub mod logging;
pub mod memory;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod routing;
pub mod topology;
