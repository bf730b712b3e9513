// Copyright (c) Viable Systems
// SPDX-License-Identifier: MIT

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tcpagent::{
    configuration::{AppConfig, ParserName},
    protocols::{mongodb, mysql, ParserFactory},
    publish::BufferedPublisher,
    system::Sniffer,
    utility::metrics,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;

    tracing_subscriber::fmt()
        .with_max_level(if config.debug {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    metrics::spawn_status_reporter(config.status_interval_sec);

    let publisher = BufferedPublisher::spawn(config.publish_buffer, config.samplerate);
    let factory = match config.parser {
        ParserName::Mongodb => ParserFactory::MongoDb {
            options: mongodb::Options {
                port: config.mongodb_port,
            },
            publisher,
        },
        ParserName::Mysql => ParserFactory::MySql {
            options: mysql::Options {
                port: config.mysql_port,
            },
            publisher,
        },
    };

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("ctrl-c received");
                running.store(false, Ordering::Relaxed);
            }
        });
    }

    let sniffer = Sniffer::new(&config.capture, factory, running)?;
    tracing::info!("listening for traffic");
    sniffer.run().await;

    let stats = metrics::snapshot();
    if let Ok(stats) = serde_json::to_string(&stats) {
        tracing::info!(stats = tracing::field::display(&stats), "final statistics");
    }

    Ok(())
}
