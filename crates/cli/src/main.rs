//! Reflect CLI entry point.
//!
//! This binary is the composition root for the entire system. Responsibilities:
//!
//! 1. **Parse configuration**: flags, environment variables, and `.env`
//!    (see [`config::Cli`]).
//! 2. **Wire observability**: configure `tracing-subscriber` with a JSON layer
//!    and, when an endpoint is configured, an OpenTelemetry OTLP exporter. All
//!    `tracing` spans and structured events emitted by every crate in the
//!    workspace flow through this layer.
//! 3. **Construct infrastructure**: create the [`llm::OpenAiCompatibleBackend`]
//!    and inject it into the [`pipeline::ModelInvoker`] shared by every stage.
//! 4. **Run and report**: run the reflection pipeline once, print one progress
//!    line per completed stage to stderr and the terminal state as JSON to
//!    stdout.
//!
//! Ctrl-C requests cooperative cancellation: the stage in flight finishes and
//! no further stage starts.
//!
//! | Exit code | Meaning |
//! |-----------|---------|
//! | 0 | run done |
//! | 1 | a stage failed |
//! | 2 | invalid configuration |
//! | 130 | cancelled |

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use llm::OpenAiCompatibleBackend;
use pipeline::{CancellationToken, ModelInvoker, RunFailure, StageSnapshot};
use serde_json::json;
use tracing::{error, info, warn};

mod config;
mod telemetry;

use config::{Cli, Settings};

const EXIT_FAILED: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_CANCELLED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is fine; every setting also has a flag.
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let telemetry = match telemetry::init() {
        Ok(t) => t,
        Err(err) => {
            eprintln!("error: {err:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let code = match cli.into_settings() {
        Ok(settings) => match run(settings).await {
            Ok(code) => code,
            Err(err) => {
                error!(error = %format!("{err:#}"), "run could not start");
                eprintln!("error: {err:#}");
                ExitCode::from(EXIT_CONFIG)
            }
        },
        Err(err) => {
            error!(error = %format!("{err:#}"), "invalid configuration");
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_CONFIG)
        }
    };

    telemetry.shutdown();
    code
}

async fn run(settings: Settings) -> Result<ExitCode> {
    let backend = OpenAiCompatibleBackend::new(settings.llm.clone())
        .context("failed to construct model backend")?;
    let invoker = ModelInvoker::new(Arc::new(backend))
        .with_temperature(settings.temperature)
        .with_timeout(Some(settings.timeout));
    let runner = nodes::reflection_runner(Arc::new(invoker))
        .context("invalid stage configuration")?
        .with_retry(settings.retry.clone());

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    info!(
        model = %settings.llm.model(),
        base_url = %settings.llm.base_url(),
        temperature = %settings.temperature,
        max_attempts = settings.retry.max_attempts,
        "starting reflection run"
    );

    let total = runner.stage_names().len();
    let mut progress = |snapshot: &StageSnapshot| {
        eprintln!(
            "[{}/{}] {} completed",
            snapshot.index + 1,
            total,
            snapshot.stage
        );
    };

    match runner
        .run_with_observer(settings.request, &cancel, &mut progress)
        .await
    {
        Ok(state) => {
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(failure) => {
            println!("{}", serde_json::to_string_pretty(&failure_report(&failure))?);
            if failure.is_cancellation() {
                Ok(ExitCode::from(EXIT_CANCELLED))
            } else {
                eprintln!("error: {failure}");
                Ok(ExitCode::from(EXIT_FAILED))
            }
        }
    }
}

fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current stage");
            cancel.cancel();
        }
    });
}

fn failure_report(failure: &RunFailure) -> serde_json::Value {
    json!({
        "run_id": failure.run_id,
        "status": if failure.is_cancellation() { "cancelled" } else { "failed" },
        "stage": failure.stage,
        "error": failure.error.to_string(),
        "partial": failure.partial,
    })
}
