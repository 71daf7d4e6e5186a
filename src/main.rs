// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use amqp_flows::{amqp::AmqpGateway, channel::new_amqp_channel, config::AppConfig, flow, logging};
use std::process::ExitCode;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let cfg = match AppConfig::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::FAILURE;
        }
    };
    logging::init(&cfg.log_level);

    let (_conn, channel) = match new_amqp_channel(&cfg).await {
        Ok(pair) => pair,
        Err(err) => {
            error!(error = err.to_string(), "broker unavailable");
            return ExitCode::FAILURE;
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        let _ = shutdown_tx.send(true);
    });

    let results = flow::run_flows(
        cfg.flows.clone(),
        AmqpGateway::new(channel),
        cfg.redelivery_policy(),
        shutdown_rx,
    )
    .await;

    if results.iter().any(|(_, result)| result.is_err()) {
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
