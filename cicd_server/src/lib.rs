//! Opsdeck CI/CD engine.
//!
//! Two execution modes share one trigger, scheduling and notification core:
//! YAML pipelines whose jobs run as cluster Jobs, and freestyle jobs whose
//! steps run over SSH or in a local shell. The binary in `main.rs` wires the
//! [`orchestrator::Orchestrator`] behind the [`routes`] HTTP surface.

pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod routes;
pub mod services;
pub mod storage;
