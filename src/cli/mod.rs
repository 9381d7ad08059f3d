//! CLI output formatting
//!
//! Provides human-readable terminal display for preflight and startup.

pub mod display;

pub use display::render_banner;
pub use display::render_preflight_report;
