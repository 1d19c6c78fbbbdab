//! Goal-directed plan execution engine.
//!
//! A natural-language goal becomes a typed plan (see [`plan`]), the plan
//! runs on [`vm::PlanVm`] against a [`commit_graph`] that records every
//! state transition, [`task`] serializes operations per task, and
//! [`mcts`] iteratively improves failing plans. [`api`] exposes all of
//! this over HTTP; [`streaming`] encodes the wire protocol for
//! in-progress execution.

pub mod api;
pub mod cache;
pub mod commit_graph;
pub mod config;
pub mod db;
pub mod error;
pub mod instructions;
pub mod labels;
pub mod mcts;
pub mod plan;
pub mod providers;
pub mod streaming;
pub mod task;
pub mod tools;
pub mod vars;
pub mod vm;

pub use error::{PlanEngineError, Result};
