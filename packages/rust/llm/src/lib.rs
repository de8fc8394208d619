//! Language model access for html2doc.
//!
//! The pipeline talks to the model only through [`LanguageModelClient`].
//! [`OpenAiClient`] implements it over HTTP; [`MockModelClient`] implements
//! it in memory for tests.

mod client;
mod json;
pub mod mock;
mod openai;

pub use client::{Completion, CompletionRequest, LanguageModelClient, ModelTask};
pub use json::{extract_items, extract_json};
pub use mock::MockModelClient;
pub use openai::OpenAiClient;
