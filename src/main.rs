use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use ai_orchestrator::app::OrchestratorConfig;
use ai_orchestrator::cli::{Cli, Commands};
use ai_orchestrator::logging::init_logging;
use ai_orchestrator::models::{CompletionOptions, Message, ModelManager, UseCase};
use ai_orchestrator::platform::AppPaths;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let paths = AppPaths::new()?;
    paths
        .ensure_dirs_exist()
        .context("Failed to create application directories")?;

    let mut config = match &cli.config {
        Some(path) => OrchestratorConfig::load_from(Some(path.as_path())),
        None => OrchestratorConfig::load(&paths),
    }
    .context("Failed to load configuration")?;
    if cli.debug {
        config.logging.enabled = true;
        config.logging.level = "debug".to_string();
    }

    let _log_guard = init_logging(&config.logging, &paths.logs_dir());
    info!(version = env!("CARGO_PKG_VERSION"), "Starting orchestrator");

    if let Commands::Config { init } = &cli.command {
        print!("{}", config.to_toml()?);
        if *init {
            match &cli.config {
                Some(path) => config.save_to(path).await?,
                None => config.save(&paths).await?,
            }
        }
        return Ok(());
    }

    let manager = ModelManager::start(&config, &paths)
        .await
        .context("Failed to initialize model manager")?;
    let outcome = run(&cli.command, &manager, &config).await;
    manager.shutdown().await;
    outcome
}

async fn run(command: &Commands, manager: &Arc<ModelManager>, config: &OrchestratorConfig) -> Result<()> {
    match command {
        Commands::Complete {
            prompt,
            stream,
            use_case,
            model,
            system,
            temperature,
            max_tokens,
        } => {
            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(Message::system(system.clone()));
            }
            messages.push(Message::user(prompt.clone()));

            let mut options = CompletionOptions::new(messages);
            if let Some(use_case) = use_case {
                options = options.with_use_case(use_case.parse::<UseCase>()?);
            }
            if let Some(model) = model {
                options = options.with_model(model.clone());
            }
            options.temperature = *temperature;
            options.max_tokens = *max_tokens;

            if *stream {
                stream_completion(manager, options).await
            } else {
                let result = manager.complete(options).await?;
                println!("{}", result.content);
                eprintln!(
                    "[{}:{}] {} tokens, {} ms",
                    result.provider, result.model, result.usage.total_tokens, result.latency_ms
                );
                Ok(())
            }
        }

        Commands::Health => {
            for result in manager.run_health_checks().await {
                match (&result.error, result.latency_ms) {
                    (None, latency) => println!(
                        "{:<12} {:<32} ok ({} ms)",
                        result.provider,
                        result.model,
                        latency.unwrap_or(0)
                    ),
                    (Some(error), _) => {
                        println!("{:<12} {:<32} FAILED: {}", result.provider, result.model, error)
                    }
                }
            }
            for breaker in manager.circuit_states() {
                println!(
                    "circuit {:<40} {:?} ({}/{})",
                    breaker.name, breaker.state, breaker.failure_count, breaker.failure_threshold
                );
            }
            Ok(())
        }

        Commands::Costs { recent } => {
            let Some(summary) = manager.cost_summary().await else {
                println!("Cost tracking is disabled");
                return Ok(());
            };
            println!(
                "{} requests, {} tokens, ${} total, {:.0} ms average",
                summary.total_requests,
                summary.total_tokens,
                summary.total_cost.round_dp(6),
                summary.average_latency_ms
            );
            for (provider, breakdown) in &summary.by_provider {
                println!(
                    "  {:<12} {:>6} requests {:>10} tokens  ${}",
                    provider,
                    breakdown.requests,
                    breakdown.total_tokens,
                    breakdown.cost.round_dp(6)
                );
            }
            for record in manager.recent_costs(*recent).await {
                println!(
                    "{} {}:{} {} tokens ${}",
                    record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    record.provider,
                    record.model,
                    record.total_tokens,
                    record.total_cost.round_dp(6)
                );
            }
            Ok(())
        }

        Commands::Models => {
            for model in manager.list_models() {
                println!(
                    "{}:{:<36} ctx {:>8}  in ${}/1k  out ${}/1k",
                    model.provider,
                    model.id,
                    model.context_window,
                    model.input_price_per_1k_tokens,
                    model.output_price_per_1k_tokens
                );
            }
            Ok(())
        }

        Commands::Monitor { interval } => {
            // Explicit request: runs even when health_check.enabled is off,
            // replacing any monitor started from configuration.
            let interval = interval
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.health_check_interval());
            if !config.health_check.enabled {
                info!("Periodic health checks are disabled in config; monitoring on request");
            }
            manager.run_health_checks().await;
            manager.start_health_monitor(interval);
            tokio::signal::ctrl_c().await?;
            info!("Interrupted, stopping monitor");
            Ok(())
        }

        Commands::Config { .. } => Ok(()),
    }
}

async fn stream_completion(manager: &ModelManager, options: CompletionOptions) -> Result<()> {
    let mut stream = manager.stream(options).await?;
    let mut stdout = std::io::stdout();
    loop {
        let next = tokio::select! {
            chunk = stream.next_chunk() => chunk?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(chunk) = next else {
            stream.cancel();
            break;
        };
        write!(stdout, "{}", chunk.delta)?;
        stdout.flush()?;
        if chunk.is_last {
            writeln!(stdout)?;
            if let Some(usage) = chunk.usage {
                eprintln!("[{} tokens]", usage.total_tokens);
            }
            break;
        }
    }
    Ok(())
}
