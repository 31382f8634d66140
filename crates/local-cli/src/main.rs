//! CLI binary to run an event engine locally against an in-process broker.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use evsched_engine::{Context, Engine, EngineConfig, Event, Trigger, topics, typed};
use evsched_transport::TransportError;
use evsched_transport_memory::{MemoryBroker, MemoryTransport};
use serde_json::{Value, json};
use tracing::{Level, info, warn};

/// CLI-specific error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Engine error
    #[error(transparent)]
    Engine(#[from] evsched_engine::Error),

    /// Broker could not be bound
    #[error("broker error: {0}")]
    Broker(#[from] TransportError),

    /// Configuration file could not be read
    #[error("config file error: {0}")]
    ConfigFile(#[from] std::io::Error),
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Engine name, also its direct-address topic
    #[arg(long, default_value = "evsched-local", env = "EVSCHED_NAME")]
    name: String,

    /// Endpoint the in-process broker binds to
    #[arg(long, default_value = "memory://evsched-local", env = "EVSCHED_ENDPOINT")]
    endpoint: String,

    /// TOML engine configuration; command-line values take precedence
    #[arg(long, env = "EVSCHED_CONFIG")]
    config: Option<PathBuf>,

    /// Worker pool size
    #[arg(long, env = "EVSCHED_MAX_WORKERS")]
    max_workers: Option<usize>,

    /// Period of the demo heartbeat event
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration, env = "EVSCHED_HEARTBEAT")]
    heartbeat: Duration,

    /// Stop after this long instead of waiting for Ctrl-C
    #[arg(long, value_parser = humantime::parse_duration, env = "EVSCHED_RUN_FOR")]
    run_for: Option<Duration>,

    /// Maximum log level
    #[arg(long, default_value_t = Level::INFO, env = "EVSCHED_LOG_LEVEL")]
    log_level: Level,
}

fn engine_config(args: &Args) -> Result<EngineConfig, Error> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_toml_str(&std::fs::read_to_string(path)?)?,
        None => EngineConfig::default(),
    };
    config.name.clone_from(&args.name);
    config.endpoint = Some(args.endpoint.clone());
    if let Some(max_workers) = args.max_workers {
        config.max_workers = max_workers;
    }
    Ok(config)
}

fn build_engine(config: EngineConfig, heartbeat: Duration) -> Result<Engine, Error> {
    let engine = Engine::builder(config.name.clone())
        .with_config(config)
        .with_transport(MemoryTransport::new())
        .on_event(topics::INIT, move |ctx: Context, _event| async move {
            info!("Engine {} initialized with token {}", ctx.name(), ctx.token());
            ctx.submit(
                Event::builder("heartbeat")
                    .trigger(Trigger::interval(heartbeat)?)
                    .build()?,
            );
            let discover = Event::builder(topics::GET_RPC_METHODS)
                .channel(topics::BROKER)
                .reply_to(ctx.token())
                .build()?;
            ctx.publish(discover);
            anyhow::Ok(())
        })
        .on_event(topics::RPC_METHODS, |ctx: Context, event: Event| async move {
            let Some(directory) = event.payload().as_object() else {
                return Ok(());
            };
            info!("Broker knows {} rpc methods", directory.len());
            if let Some(token) = directory.get("add").and_then(Value::as_str) {
                let call = Event::builder("add")
                    .payload(json!([20, 22]))
                    .channel(token)
                    .reply_to(ctx.token())
                    .build()?;
                ctx.publish(call);
            }
            anyhow::Ok(())
        })
        .on_event("add", |_ctx, event: Event| async move {
            info!(correlation_id = ?event.correlation_id(), "add replied {}", event.payload());
            Ok(())
        })
        .on_event("heartbeat", |ctx: Context, event: Event| async move {
            let beats = ctx.get("beats").as_ref().and_then(Value::as_u64).unwrap_or(0) + 1;
            ctx.set("beats", beats);
            let fired_at = event.trigger().and_then(Trigger::last_fire);
            info!(?fired_at, "Heartbeat {}", beats);
            Ok(())
        })
        .rpc_method("echo", typed(|value: Value| Ok(value)))
        .rpc_method("add", typed(|(a, b): (i64, i64)| Ok(a + b)))
        .build()?;
    Ok(engine)
}

async fn wait_for_shutdown(run_for: Option<Duration>) {
    let deadline = async {
        match run_for {
            Some(period) => tokio::time::sleep(period).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Received interrupt signal"),
            Err(e) => warn!("Cannot listen for Ctrl-C: {}", e),
        },
        () = deadline => info!("Run time elapsed"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .init();

    let config = engine_config(&args)?;
    let broker = MemoryBroker::bind(args.endpoint.as_str())?;
    let engine = build_engine(config, args.heartbeat)?;

    let runner = engine.clone();
    let running = tokio::spawn(async move { runner.start().await });

    wait_for_shutdown(args.run_for).await;
    info!("Shutting down");
    engine.stop().await;

    match running.await {
        Ok(result) => result?,
        Err(e) => warn!("Engine task failed: {}", e),
    }
    broker.shutdown();
    Ok(())
}
