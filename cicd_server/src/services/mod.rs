//! Engine services — parsing, execution, triggering, scheduling and storage of outputs.

pub mod artifact_service;
pub mod cluster;
pub mod cron;
pub mod freestyle_executor;
pub mod freestyle_service;
pub mod host_service;
pub mod notification;
pub mod output_stream;
pub mod parser;
pub mod pipeline_executor;
pub mod pipeline_service;
pub mod remote_session;
pub mod retention;
pub mod scheduler;
pub mod scm_checkout;
pub mod signature;
pub mod trigger_gateway;
pub mod variables;
pub mod vault;
