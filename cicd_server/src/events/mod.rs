//! Lifecycle events emitted when runs and builds change state.

pub mod lifecycle;
