// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use telemetry_pipeline::config::{load_config_with_env, LoggingConfig};
use telemetry_pipeline::relay::{self, DemoRunner, RelayFeed, RelayHub, RelayState};
use telemetry_pipeline::{
    run_collector, source_from_config, BrokerFactory, MemoryStore, PersistenceConsumer,
    SessionManager, TelemetryProducer, TelemetryStore, TopicProvisioner,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    /// Collector, persistence consumer and relay in one process
    All,
    Collector,
    Consumer,
    Relay,
}

impl Role {
    fn runs(self, role: Role) -> bool {
        self == Role::All || self == role
    }
}

/// Telemetry Pipeline - collect, persist and relay vehicle telemetry
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/default.yaml")]
    config: PathBuf,

    /// Which parts of the pipeline to run
    #[arg(short, long, value_enum, default_value = "all")]
    role: Role,

    /// User id of the collected session (overrides config file)
    #[arg(short, long)]
    user_id: Option<String>,

    /// Session id to collect into (overrides config file)
    #[arg(short, long)]
    session_id: Option<String>,
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.to_lowercase()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match logging.format.as_str() {
        "compact" => builder.compact().try_init(),
        _ => builder.try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}

type Task = (&'static str, Result<()>);

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration from file
    let mut config = load_config_with_env(&args.config)?;

    // Apply CLI overrides
    if let Some(user_id) = args.user_id {
        config.source.user_id = user_id;
    }
    if let Some(session_id) = args.session_id {
        config.source.session_id = Some(session_id);
    }

    init_tracing(&config.logging)?;

    info!("Starting Telemetry Pipeline ({:?})", args.role);
    info!("Loaded configuration from: {:?}", args.config);
    info!("Broker backend: {}", config.broker.backend);

    if args.role != Role::All {
        BrokerFactory::check_split_roles(&config.broker)?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let broker = BrokerFactory::create(&config.broker).await?;
    let store: Arc<dyn TelemetryStore> = Arc::new(MemoryStore::new());
    store.initialize().await?;
    info!("Storage backend initialized: {}", store.backend_type());

    let manager = Arc::new(SessionManager::new(store.clone()));
    let provisioner = Arc::new(TopicProvisioner::new(broker.clone(), &config.broker.topics));
    let mut tasks: JoinSet<Task> = JoinSet::new();

    if args.role.runs(Role::Consumer) {
        let consumer = Arc::new(PersistenceConsumer::new(
            broker.clone(),
            store.clone(),
            provisioner.naming().clone(),
            config.consumer.clone(),
        ));
        manager.register_closer(consumer.clone());
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { ("consumer", consumer.run(shutdown).await) });
    }

    if args.role.runs(Role::Relay) {
        let hub = Arc::new(
            RelayHub::new(config.relay.viewer_channel_capacity).with_closed_ttl(
                Duration::from_secs(config.relay.closed_session_ttl_secs),
            ),
        );
        manager.register_closer(hub.clone());

        let feed = RelayFeed::new(
            broker.clone(),
            provisioner.naming().clone(),
            hub.clone(),
            config.relay.group_id.clone(),
        );
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { ("relay feed", feed.run(shutdown).await) });

        let demos = Arc::new(DemoRunner::new(
            broker.clone(),
            provisioner.clone(),
            manager.clone(),
            hub.clone(),
            config.producer.clone(),
            config.source.demo.clone(),
        ));
        manager.register_closer(demos.clone());

        let state = Arc::new(RelayState::new(hub, demos, &config.relay));
        let bind = config.relay.bind.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { ("relay", relay::serve(state, &bind, shutdown).await) });
    }

    let mut producer = None;
    if args.role.runs(Role::Collector) {
        let source = source_from_config(&config.source, shutdown_rx.clone()).await?;
        let session = manager
            .create(
                config.source.session_id.clone(),
                &config.source.user_id,
                source.kind(),
                Vec::new(),
            )
            .await?;
        manager.start(&session.id).await?;
        info!(
            "Collecting {:?} telemetry for user '{}' into session '{}'",
            source.kind(),
            session.user_id,
            session.id
        );

        let started = TelemetryProducer::start(
            broker.clone(),
            &provisioner,
            &session.user_id,
            &session.id,
            session.source,
            &config.producer,
        )
        .await?;
        manager.register_closer(started.clone());
        producer = Some(started.clone());

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            let result = run_collector(source, started, shutdown).await.map(|_| ());
            ("collector", result)
        });
    }

    // Run until Ctrl+C or a fatal task failure
    let mut failed = false;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
            joined = tasks.join_next() => match joined {
                None => break,
                Some(Ok((name, Ok(())))) => info!("{} finished", name),
                Some(Ok((name, Err(e)))) => {
                    error!("{} failed: {:#}", name, e);
                    failed = true;
                    break;
                }
                Some(Err(e)) => {
                    error!("Pipeline task panicked: {}", e);
                    failed = true;
                    break;
                }
            }
        }
    }

    // Cleanup
    let _ = shutdown_tx.send(true);
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, Err(e))) => error!("{} failed during shutdown: {:#}", name, e),
            Ok(_) => {}
            Err(e) => error!("Pipeline task panicked during shutdown: {}", e),
        }
    }
    if let Some(producer) = producer {
        producer.close().await;
    }

    if failed {
        bail!("Telemetry Pipeline stopped after a fatal error");
    }
    info!("Telemetry Pipeline shut down successfully");
    Ok(())
}
