//! Concrete [`llm::LlmProvider`] adapters. The `llm` crate deliberately
//! ships only the trait contract and a `MockProvider`; this module is the
//! "external collaborator" its docs describe, built for the one binary
//! (`planengine-server`) that actually needs to talk to a live model.

pub mod openai_compatible;

pub use openai_compatible::OpenAiCompatibleProvider;
