//! Command-line and environment configuration.
//!
//! Every setting can come from a flag or an environment variable; a `.env`
//! file in the working directory is loaded before parsing.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use llm::{LlmConfig, DEFAULT_BASE_URL, DEFAULT_MODEL};
use pipeline::{RetryConfig, Temperature};

/// Request used when none is given on the command line.
pub const DEFAULT_REQUEST: &str = "Write a Python function to find the nth Fibonacci number.";

/// Draft, critique, and refine code for a request with an LLM.
#[derive(Debug, Parser)]
#[command(name = "reflect", version, about)]
pub struct Cli {
    /// The coding request to run through the pipeline.
    #[arg(default_value = DEFAULT_REQUEST)]
    pub request: String,

    /// API key for the model endpoint.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: String,

    /// Model identifier sent with every call.
    #[arg(long, env = "OPENAI_MODEL", default_value = DEFAULT_MODEL)]
    pub model: String,

    /// Base URL of the OpenAI-compatible endpoint.
    #[arg(long, env = "OPENAI_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    /// Sampling temperature, between 0 and 2.
    #[arg(long, env = "REFLECT_TEMPERATURE", default_value_t = 0.2)]
    pub temperature: f64,

    /// Per-call deadline in seconds.
    #[arg(long, env = "REFLECT_TIMEOUT_SECS", default_value_t = 120)]
    pub timeout_secs: u64,

    /// Attempts per stage for retryable backend failures (1 disables retry).
    #[arg(long, env = "REFLECT_MAX_ATTEMPTS", default_value_t = 1)]
    pub max_attempts: u32,
}

/// Validated settings derived from [`Cli`].
#[derive(Debug, Clone)]
pub struct Settings {
    /// Non-blank request handed to the first stage.
    pub request: String,
    /// Endpoint, model, and credentials for the HTTP backend.
    pub llm: LlmConfig,
    /// Sampling temperature applied to every stage.
    pub temperature: Temperature,
    /// Deadline for a single model call.
    pub timeout: Duration,
    /// Per-stage retry policy; a single attempt unless configured.
    pub retry: RetryConfig,
}

impl Cli {
    /// Validates the raw arguments.
    pub fn into_settings(self) -> Result<Settings> {
        if self.request.trim().is_empty() {
            bail!("request must not be empty");
        }
        let Some(temperature) = Temperature::new(self.temperature) else {
            bail!("temperature {} is outside 0..=2", self.temperature);
        };
        if self.timeout_secs == 0 {
            bail!("timeout must be at least one second");
        }
        if self.max_attempts == 0 {
            bail!("max attempts must be at least 1");
        }
        let timeout = Duration::from_secs(self.timeout_secs);
        let llm = LlmConfig::new(self.api_key)
            .and_then(|c| c.with_model(self.model))
            .and_then(|c| c.with_base_url(&self.base_url))
            .context("invalid model backend settings")?
            .with_timeout(timeout);

        Ok(Settings {
            request: self.request,
            llm,
            temperature,
            timeout,
            retry: RetryConfig::attempts(self.max_attempts),
        })
    }
}
