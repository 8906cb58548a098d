//! CLI surface.
//!
//! Grounded in the flag-oriented style of `rama-cli` rather than the
//! teacher's `DownloadConfig` (which exists for an IPC boundary with a
//! frontend that doesn't apply here). `clap`'s derive API replaces the
//! hand-rolled struct-of-options the teacher passes into `Downloader::new`.

use std::path::PathBuf;

use clap::Parser;

/// Number of mirror connections the scheduler has been exercised at.
/// The design is parameterized but not generalized beyond this; see
/// spec.md's Non-goals.
pub const MIRROR_COUNT: usize = 3;

#[derive(Debug, Parser)]
#[command(
    name = "multiget",
    about = "Download a single large file from multiple mirrored HTTPS origins in parallel"
)]
pub struct Cli {
    /// Absolute path on the origin server.
    #[arg(short = 't', long = "target")]
    pub target: String,

    /// Destination file name; created/truncated.
    #[arg(short = 'o', long = "output")]
    pub output: PathBuf,

    /// Exactly three mirror hostnames or host:port pairs (missing port
    /// defaults to 443).
    #[arg(required = true, num_args = 3)]
    pub servers: Vec<String>,

    /// Raise log verbosity. Repeat for more detail (-v, -vv).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Emit structured JSON logs instead of the human-readable format.
    #[arg(long = "json-log")]
    pub json_log: bool,

    /// Emit a gnuplot script alongside the per-connection trace files.
    #[arg(long = "plot")]
    pub plot: bool,
}

impl Cli {
    /// Splits a `host` or `host:port` positional into `(host, port)`,
    /// defaulting the port to 443 per spec.md §6.1.
    pub fn mirror_addr(server: &str) -> (String, u16) {
        match server.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => (host.to_string(), port),
                Err(_) => (server.to_string(), 443),
            },
            None => (server.to_string(), 443),
        }
    }
}
