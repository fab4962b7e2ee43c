use anyhow::{Context, Result};
use attester_config::{load_admission_dir, Config, ConfigLoader};
use attester_core::{AttesterBuilder, AttesterContext, EventBus};
use attester_delivery::{DeliveryError, RetryFailureHook};
use attester_types::{AttesterEvent, RoundEvent, SubmissionEvent, SubmissionRequest};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod factories;

#[derive(Parser)]
#[command(name = "attester")]
#[command(about = "Commit-reveal attestation client", long_about = None)]
struct Cli {
	#[command(subcommand)]
	command: Option<Commands>,

	#[arg(short, long, value_name = "FILE", default_value = "config/attester.toml")]
	config: PathBuf,

	#[arg(long, env = "ATTESTER_LOG_LEVEL", default_value = "info")]
	log_level: String,

	#[arg(long, value_enum, default_value_t = LogFormat::Text)]
	log_format: LogFormat,
}

#[derive(Subcommand)]
enum Commands {
	/// Start the attester
	Start,
	/// Validate the configuration file
	Validate,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
	Text,
	Json,
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();

	setup_tracing(&cli.log_level, cli.log_format)?;

	match cli.command {
		Some(Commands::Start) | None => start_attester(cli).await,
		Some(Commands::Validate) => validate_config(cli).await,
	}
}

async fn load_config(cli: &Cli) -> Result<Config> {
	info!("Loading configuration from: {:?}", cli.config);
	ConfigLoader::new()
		.with_file(&cli.config)
		.load()
		.await
		.context("Failed to load configuration")
}

async fn start_attester(cli: Cli) -> Result<()> {
	let config = load_config(&cli).await?;
	info!("Attester name: {}", config.attester.name);
	info!("Submitter: {}", config.attester.submitter_address);

	let engine = factories::register_all(AttesterBuilder::new(config))
		.with_retry_failure_hook(exit_on_retry_failure())
		.build()
		.await
		.context("Failed to build attester")?;

	let events = tokio::spawn(log_events(engine.event_bus().clone()));

	engine
		.run(setup_shutdown_signal())
		.await
		.context("Attester stopped with an error")?;

	events.abort();
	info!("Attester stopped");
	Ok(())
}

async fn validate_config(cli: Cli) -> Result<()> {
	let config = load_config(&cli).await?;
	let context = AttesterContext::from_config(&config.attester)?;
	let admission = load_admission_dir(&config.attester.admission_config_dir)
		.await
		.context("Failed to load admission configs")?;

	// build every backend once so that bad backend settings fail here
	attester_storage::create_storage(&config.storage.backend, &config.storage.config)
		.with_context(|| format!("Unknown storage backend: {}", config.storage.backend))?;
	attester_delivery::create_submitter(&config.delivery.backend, &config.delivery.config)?;
	for source in config.discovery.sources.values() {
		let backend = source.get("backend").and_then(|v| v.as_str()).unwrap_or_default();
		attester_discovery::create_discovery(backend, source)?;
	}
	for (source, source_config) in config.source_configs()? {
		let verifier = &source_config.verifier;
		attester_verification::create_verifier(&verifier.backend, &verifier.config)?;
		info!(
			"  Source {}: {} req/s, {} in flight, verifier {} for {:?}",
			source,
			source_config.max_requests_per_second,
			source_config.max_processing_transactions,
			verifier.backend,
			verifier.attestation_types
		);
	}

	info!("Configuration is valid");
	info!("Attester name: {}", config.attester.name);
	info!(
		"Round period: {}s, current round: {}",
		config.attester.round_duration_sec,
		context
			.epoch
			.round_id_for_time(attester_core::epoch::now_ms())
	);
	info!("Storage: {}", config.storage.backend);
	info!("Delivery: {}", config.delivery.backend);
	info!("Discovery sources: {}", config.discovery.sources.len());
	info!("Admission configs: {}", admission.len());

	Ok(())
}

/// Submission retries are the one failure the attester cannot absorb.
fn exit_on_retry_failure() -> RetryFailureHook {
	Arc::new(|request: &SubmissionRequest, error: &DeliveryError| {
		error!(
			buffer_number = request.buffer_number,
			"{} failed permanently, exiting: {}",
			request.action,
			error
		);
		std::process::exit(1);
	})
}

async fn log_events(event_bus: EventBus) {
	let mut events = event_bus.subscribe();
	loop {
		match events.recv().await {
			Ok(AttesterEvent::Round(RoundEvent::Committed {
				round_id,
				merkle_root,
				valid,
				total,
			})) => {
				info!(round_id, %merkle_root, valid, total, "Round committed");
			}
			Ok(AttesterEvent::Round(RoundEvent::ProcessingTimeout {
				round_id,
				processed,
				total,
			})) => {
				warn!(round_id, processed, total, "Round missed its commit deadline");
			}
			Ok(AttesterEvent::Submission(SubmissionEvent::Submitted {
				round_id,
				buffer_number,
				tx_hash,
			})) => {
				info!(round_id, buffer_number, %tx_hash, "Submission accepted");
			}
			Ok(AttesterEvent::Submission(SubmissionEvent::Failed {
				round_id,
				buffer_number,
				error,
			})) => {
				error!(round_id, buffer_number, %error, "Submission failed");
			}
			Ok(other) => tracing::debug!(?other, "Attester event"),
			Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
				warn!(skipped, "Event logger lagging");
			}
			Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
		}
	}
}

fn setup_tracing(log_level: &str, format: LogFormat) -> Result<()> {
	let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

	let registry = tracing_subscriber::registry().with(env_filter);
	match format {
		LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
		LogFormat::Json => registry
			.with(tracing_subscriber::fmt::layer().json())
			.init(),
	}

	Ok(())
}

async fn setup_shutdown_signal() {
	let ctrl_c = async {
		if let Err(e) = signal::ctrl_c().await {
			error!("Failed to listen for Ctrl+C: {}", e);
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match signal::unix::signal(signal::unix::SignalKind::terminate()) {
			Ok(mut sigterm) => {
				sigterm.recv().await;
			}
			Err(e) => {
				error!("Failed to install SIGTERM handler: {}", e);
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
}
