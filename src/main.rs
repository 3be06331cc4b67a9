use anyhow::{Context, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use stepline::broker::{topology::default_instance, BrokerClient, Delivery, DeliveryHandler, MemoryBroker, Topology, UrlPool};
use stepline::cli::commands::{BrokerCommand, RunCommand, ValidateCommand};
use stepline::cli::output::*;
use stepline::cli::{demo, Cli, Command};
use stepline::execution::{ConsoleTracer, Tracer};
use stepline::persistence::{DocumentStore, InMemoryDocuments};
use stepline::resource::{LadderConfig, ResourceCache};
use stepline::{ChainRuntime, Fragment, Input, RuntimeConfig};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    let config = cli.load_config().context("Failed to load runtime config")?;

    // Execute command
    match &cli.command {
        Command::Run(cmd) => run_greeting(cmd, &config).await?,
        Command::Broker(cmd) => run_broker(cmd, &config).await?,
        Command::Validate(cmd) => validate_config(cmd, &config)?,
    }

    Ok(())
}

fn runtime(config: &RuntimeConfig) -> Arc<ChainRuntime> {
    let tracer: Option<Arc<dyn Tracer>> = if config.mode.is_production() {
        None
    } else {
        Some(Arc::new(ConsoleTracer::stderr(config.trace.indent)))
    };
    ChainRuntime::from_config(config, tracer)
}

#[cfg(feature = "sqlite")]
fn document_store(cmd: &RunCommand, config: &RuntimeConfig) -> Result<Arc<dyn DocumentStore>> {
    use stepline::persistence::SqliteDocumentStore;

    if cmd.in_memory {
        return Ok(Arc::new(InMemoryDocuments::new()));
    }
    let ladder = LadderConfig::from(&config.ladder);
    let store = match &config.store.url {
        Some(url) => SqliteDocumentStore::new(url, ladder),
        None => SqliteDocumentStore::with_default_path(ladder)?,
    };
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite"))]
fn document_store(cmd: &RunCommand, _config: &RuntimeConfig) -> Result<Arc<dyn DocumentStore>> {
    if !cmd.in_memory {
        tracing::warn!("Built without sqlite support, keeping documents in memory");
    }
    Ok(Arc::new(InMemoryDocuments::new()))
}

async fn run_greeting(cmd: &RunCommand, config: &RuntimeConfig) -> Result<()> {
    let store = document_store(cmd, config)?;
    demo::seed(store.as_ref()).await.context("Failed to seed documents")?;

    let registry = demo::registry(&runtime(config), store);
    let method = demo::greeting_method()
        .bind(&registry, &Fragment::new())
        .context("Failed to bind the greeting method")?;
    println!(
        "{} Greeting {} → {}",
        ROCKET,
        style(&cmd.greeter_id).bold(),
        style(&cmd.greetee_id).bold()
    );

    let mut fragment = Fragment::new()
        .with("greeterId", cmd.greeter_id.as_str())
        .with("greeteeId", cmd.greetee_id.as_str())
        .with("salutation", cmd.salutation.as_str());
    for (key, value) in &cmd.var {
        fragment.insert(key.as_str(), value.as_str());
        println!("{} Scope value: {} = {}", INFO, style(key).cyan(), style(value).dim());
    }

    let outcome = method.run(Input::new().with(fragment)).await?;
    println!("{}", format_outcome("greet", &outcome));
    if outcome.is_ok() {
        println!("  {}", format_document(outcome.merged().values()));
        Ok(())
    } else {
        std::process::exit(1);
    }
}

async fn run_broker(cmd: &BrokerCommand, config: &RuntimeConfig) -> Result<()> {
    let broker = MemoryBroker::new();
    broker.fail_next_connects(cmd.fail_connects);

    let urls = if config.broker.urls.is_empty() {
        vec!["memory://localhost".to_string()]
    } else {
        config.broker.urls.clone()
    };
    let instance = config.broker.instance.clone().unwrap_or_else(default_instance);

    let received = Arc::new(AtomicUsize::new(0));
    let handler: DeliveryHandler = {
        let received = received.clone();
        Arc::new(move |delivery: Delivery| {
            tracing::debug!(tag = delivery.tag, routing_key = %delivery.routing_key, "Received event");
            received.fetch_add(1, Ordering::SeqCst);
        })
    };
    let topology = Topology::new(&cmd.model, instance)
        .with_results(None)
        .with_notifications(None, None)
        .with_events(Some(cmd.event.as_str()), Some(handler));

    let client = BrokerClient::new(
        Arc::new(broker.clone()),
        Arc::new(UrlPool::new(urls)),
        topology,
        ResourceCache::new(),
        LadderConfig::from(&config.ladder),
    )?;
    let entry = demo::publish_pipeline(&runtime(config), client.clone());

    let spinner = create_spinner(format!("{} publishers waiting for the broker", cmd.publishers));
    let mut tasks = Vec::new();
    for publisher in 0..cmd.publishers {
        let entry = entry.clone();
        let input = Input::new().with(
            Fragment::new()
                .with("eventName", cmd.event.as_str())
                .with("publisher", publisher as u64)
                .with("data", serde_json::json!({ "publisher": publisher })),
        );
        tasks.push(tokio::spawn(async move { entry.run(input).await }));
    }

    let mut failed = 0;
    for task in tasks {
        let outcome = task.await.context("Publisher task panicked")??;
        if !outcome.is_ok() {
            failed += 1;
            spinner.println(format_outcome("publish", &outcome));
        }
    }
    spinner.finish_and_clear();

    println!(
        "{} {} published, {} failed, {} ladder retries",
        if failed == 0 { CHECK } else { WARN },
        style(cmd.publishers - failed).green(),
        style(failed).red(),
        style(client.ladder().retries()).yellow()
    );
    println!("  {}", format_broker_stats(&broker.stats()));
    println!("  received: {}", style(received.load(Ordering::SeqCst)).cyan());
    Ok(())
}

fn validate_config(cmd: &ValidateCommand, config: &RuntimeConfig) -> Result<()> {
    println!("{} Runtime configuration is valid!", CHECK);
    println!("  Mode: {}", style(format!("{:?}", config.mode)).bold());
    println!("  Retry delay: {}", style(format!("{:?}", config.ladder.retry_delay())).cyan());
    println!("  Broker urls: {}", style(config.broker.urls.len()).cyan());
    if let Some(url) = &config.store.url {
        println!("  Store: {}", style(url).dim());
    }

    if cmd.json {
        let json = serde_json::to_string_pretty(config)?;
        println!("\n{}", json);
    }
    Ok(())
}
