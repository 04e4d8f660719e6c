//! Reflect model backend adapter.
//!
//! Implements the [`pipeline::LlmBackend`] trait for any endpoint that speaks
//! the OpenAI chat-completions protocol (OpenAI, DeepSeek, vLLM, llama.cpp
//! server). Other protocols are added as new backend types in this crate
//! without any changes to the `pipeline` crate.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** HTTP transport, request formatting, response envelope
//! parsing, and `Retry-After` handling live here. The [`pipeline`] crate sees
//! only [`pipeline::LlmBackend`] and [`pipeline::BackendError`]; retrying is the
//! runner's decision.

pub mod config;
pub mod openai;

pub use config::{LlmConfig, LlmConfigError, DEFAULT_BASE_URL, DEFAULT_MODEL};
pub use openai::OpenAiCompatibleBackend;
