//! multiget - parallel HTTP/2 byte-range downloader
//!
//! Downloads a single large file from multiple mirrored HTTPS origins at
//! once, splitting byte ranges across them in proportion to measured
//! per-connection throughput so that every mirror finishes at
//! approximately the same time.
//!
//! Subsystems:
//! - **Request factory (`request`)**: builds the three `Range` header
//!   shapes the scheduler needs.
//! - **Bandwidth counter (`bandwidth`)**: per-connection byte counter and
//!   sliding-window rate estimator, plus the trace-file sink.
//! - **RTT monitor (`rtt`)**: background PING sampler feeding the
//!   bandwidth-delay-product calculation.
//! - **Connection (`connection`)**: TLS+HTTP/2 client wrapper and the
//!   choke mechanism.
//! - **Mirror (`mirror`)**: the trait seam the scheduler depends on
//!   instead of `connection` directly, so it can be driven by a fake pool
//!   in tests.
//! - **Range scheduler (`scheduler`)**: the recursive split/race/choke
//!   algorithm.
//! - **Bootstrap (`bootstrap`)**: dials the mirror pool and drives the
//!   scheduler end to end.

pub mod bandwidth;
pub mod bootstrap;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod error;
pub mod mirror;
pub mod plot;
pub mod request;
pub mod rtt;
pub mod scheduler;

use std::io::IsTerminal as _;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes the global tracing subscriber. `verbosity` is the CLI's
/// repeated `-v` count; `json` switches to structured JSON output.
pub fn init_tracing(verbosity: u8, json: bool) {
    let default_directive = match verbosity {
        0 => "multiget=info",
        1 => "multiget=debug",
        _ => "multiget=trace",
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default_directive.parse().expect("valid directive"))
        .from_env_lossy();

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_ansi(std::io::stderr().is_terminal())
                    .with_writer(std::io::stderr)
                    .json()
                    .flatten_event(true),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
