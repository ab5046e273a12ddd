use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use std::env;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use events_bus::events::{self, ProductIdentifiedEvent, PromotionCreatedEvent, UserRegisteredEvent};
use events_bus::{
    Event, EventBus, EventBusConfig, EventBusError, HandlerContext, LogDeadLetters, ReceivedEvent,
    SubscriptionSpec,
};

/// Event bus operations tool
#[derive(Parser, Debug)]
#[command(name = "events-bus")]
#[command(about = "Inspect and exercise the event bus")]
struct Args {
    /// Configuration file (YAML, TOML or JSON), overlaid by EVENTS_BUS__* variables
    #[arg(short, long, env = "EVENTS_BUS_CONFIG")]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check broker connectivity
    Health,

    /// Publish sample events
    PublishDemo {
        #[arg(long, value_enum, default_value = "user")]
        kind: DemoKind,

        #[arg(short = 'n', long, default_value = "1")]
        count: usize,
    },

    /// Consume a stream and log every event until Ctrl-C
    Subscribe {
        #[arg(short, long)]
        stream: String,

        /// Consumer group, defaults to the configured one
        #[arg(short, long)]
        group: Option<String>,

        /// Consumer id, defaults to the configured or a generated one
        #[arg(long)]
        consumer: Option<String>,

        /// Fail every delivery to exercise the retry path
        #[arg(long)]
        fail: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DemoKind {
    User,
    Promotion,
    Product,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    init_tracing(args.verbose)?;

    let config = EventBusConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    let bus = EventBus::connect(config).await.context("failed to connect event bus")?;

    let outcome = match args.command {
        Command::Health => health(&bus).await,
        Command::PublishDemo { kind, count } => publish_demo(&bus, kind, count).await,
        Command::Subscribe {
            stream,
            group,
            consumer,
            fail,
        } => subscribe(&bus, stream, group, consumer, fail).await,
    };

    bus.close().await?;
    outcome
}

fn init_tracing(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    let is_development = env::var("EVENTS_BUS_ENV").unwrap_or_else(|_| "development".to_string()) == "development";
    let use_colors = env::var("NO_COLOR").is_err() && atty::is(atty::Stream::Stdout);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("events_bus={},ops_cli={},redis=warn", level, level).into());

    if is_development {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(use_colors)
                    .with_level(true),
            )
            .try_init()?;
    } else {
        // Structured JSON logging for production
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .json(),
            )
            .try_init()?;
    }

    Ok(())
}

async fn health(bus: &EventBus) -> Result<()> {
    match bus.health().await {
        Ok(()) => {
            println!("{} broker is reachable ({:?})", "✔".bright_green(), bus.config().backend);
            Ok(())
        }
        Err(e) => {
            println!("{} broker is unreachable: {}", "✘".bright_red(), e);
            Err(e.into())
        }
    }
}

async fn publish_demo(bus: &EventBus, kind: DemoKind, count: usize) -> Result<()> {
    let publisher = bus.publisher();

    for n in 0..count {
        let event: Box<dyn Event> = match kind {
            DemoKind::User => Box::new(UserRegisteredEvent::new(
                format!("demo-user-{}", n),
                format!("demo{}@example.com", n),
            )),
            DemoKind::Promotion => Box::new(
                PromotionCreatedEvent::new(
                    format!("demo-promo-{}", n),
                    "Demo promotion",
                    "demo-distributor",
                    "demo-leaflet",
                    1,
                    9.99,
                )
                .with_original_price(12.5),
            ),
            DemoKind::Product => Box::new(ProductIdentifiedEvent::new(
                format!("demo-promo-{}", n),
                format!("demo-product-{}", n),
                "demo-type",
                "demo-category",
                None,
                0.9,
            )),
        };

        let stream = events::stream_for(event.event_type())
            .context("demo event type has no stream")?;
        let id = publisher.publish(stream, event.as_ref()).await?;
        println!(
            "{} {} {} → {} ({})",
            "published".bright_green(),
            event.event_type().bright_white(),
            event.event_id(),
            stream.bright_yellow(),
            id
        );
    }

    Ok(())
}

async fn subscribe(
    bus: &EventBus,
    stream: String,
    group: Option<String>,
    consumer: Option<String>,
    fail: bool,
) -> Result<()> {
    let mut consumer_config = bus.config().consumer.clone();
    if let Some(group) = group {
        consumer_config.group = group;
    }
    if let Some(consumer) = consumer {
        consumer_config.consumer_id = consumer;
    }
    if consumer_config.group.trim().is_empty() {
        anyhow::bail!("no consumer group given (use --group or EVENTS_BUS__CONSUMER__GROUP)");
    }

    let handler = move |ctx: HandlerContext, event: ReceivedEvent| async move {
        info!(
            id = %ctx.message_id(),
            event_id = %event.id,
            event_type = %event.event_type,
            attempt = event.attempt,
            payload = %event.payload,
            "Received event"
        );
        if fail {
            return Err(anyhow::anyhow!("failing on purpose"));
        }
        Ok::<(), anyhow::Error>(())
    };

    let spec = SubscriptionSpec::from_config(stream, &consumer_config, handler).dead_letter(LogDeadLetters);
    info!(?spec, "Subscribing, press Ctrl-C to stop");

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Shutdown requested");
            shutdown.cancel();
        }
    });

    let subscriber = bus.subscriber();
    let result = subscriber.subscribe(spec, cancel).await;
    let stats = subscriber.stats();
    println!(
        "{} received={} acknowledged={} retried={} dropped={} malformed={} abandoned={}",
        "stats".bright_cyan(),
        stats.received,
        stats.acknowledged,
        stats.retried,
        stats.dropped,
        stats.malformed,
        stats.abandoned
    );

    match result {
        Ok(()) | Err(EventBusError::Cancelled) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
