//! Control layer exposing endpoint state to external tooling.

/// High-level control API for the endpoint.
pub mod api;
/// Ratatui-based developer console.
pub mod ui;
