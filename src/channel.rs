// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation of AMQP connections and channels. The
//! connection is owned by the caller; the channel is handed to the
//! [`crate::amqp::AmqpGateway`].

use crate::{config::AppConfig, errors::GatewayError};
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tracing::{debug, error};

/// Creates a new AMQP channel for communication with the broker.
///
/// This function connects to `cfg.broker_url`, naming the connection after the
/// application, then creates a channel on that connection.
///
/// # Returns
/// * `Result<(Arc<Connection>, Arc<Channel>), GatewayError>` -
///   The connection and channel on success, or an error on failure.
pub async fn new_amqp_channel(
    cfg: &AppConfig,
) -> Result<(Arc<Connection>, Arc<Channel>), GatewayError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.app_name.clone()));

    let conn = match Connection::connect(&cfg.broker_url, options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(GatewayError::ConnectionError(err.to_string()))
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((Arc::new(conn), Arc::new(c)))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(GatewayError::ChannelError(err.to_string()))
        }
    }
}
