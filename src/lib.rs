// THEORY:
// This file is the main entry point for the `radar_labeler` library crate.
// It turns captures of a circular radar/minimap region into stable bearing and
// distance labels, and curates the resulting dataset so that no label
// combination dominates it.
//
// The primary goal is to export the `CaptureSession` (and its thread-safe
// `SessionHandle`) as the high-level interface. The per-layer modules in
// `core_modules` stay public for tools that need a single stage, such as
// recomputing quota counts or classifying a stored bearing, but callers
// normally never touch them directly.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod pipeline;
