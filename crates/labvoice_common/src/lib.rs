//! Shared library for the labvoice assistant: domain types, configuration,
//! number-word extraction and the Ollama runtime client.

pub mod config;
pub mod numbers;
pub mod ollama;
pub mod types;
