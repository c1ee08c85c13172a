//! Operational helpers for [trillium](https://trillium.rs) services: typed flag accessors,
//! jaeger/zipkin tracer setup, prometheus request metrics, and the tracing configuration model.
//!
//! Each piece is independent and lives behind its own cargo feature:
//!
//! * [`flags`] (`flags`): `must_get_*` accessors over [`clap`] matches
//! * [`trace`] and [`propagation`] (`trace`): tracer provider setup and context propagation
//! * [`Metrics`] (`metrics`): a prometheus collector and a handler wrapper that records it
//! * [`config`]: the tracing configuration and its JSON Schema
#![forbid(unsafe_code)]
#![deny(
    missing_copy_implementations,
    rustdoc::missing_crate_level_docs,
    missing_debug_implementations,
    nonstandard_style,
    unused_qualifications,
    missing_docs
)]

pub mod config;
pub mod fatal;

#[cfg(feature = "flags")]
pub mod flags;

#[cfg(feature = "metrics")]
mod instrument;
#[cfg(feature = "metrics")]
mod metrics;

#[cfg(feature = "trace")]
pub mod propagation;
#[cfg(feature = "trace")]
pub mod trace;

#[cfg(feature = "metrics")]
pub use instrument::{Instrumented, StatusBucketPolicy};
#[cfg(feature = "metrics")]
pub use metrics::{status_bucket, Metrics};
#[cfg(feature = "metrics")]
pub use prometheus;

#[cfg(feature = "trace")]
pub use opentelemetry;
