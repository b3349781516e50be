//! # Consent Capture Library
//!
//! Consent-first collection of location fixes and camera frames with durable,
//! at-least-once delivery to an ingestion endpoint.
//!
//! Nothing is captured for a capability until the user has explicitly granted
//! it under the current consent agreement. Captured events are journaled
//! locally before delivery, so they survive restarts and network outages.
//!
//! [`pipeline::PipelineContext`] wires the components together and is the
//! entry point for hosts.

pub mod buffer;
pub mod capture;
pub mod config;
pub mod consent;
pub mod delivery;
pub mod diagnostics;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod schedule;
pub mod session;
pub mod storage;
