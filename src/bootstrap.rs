//! Bootstrap: dials the mirror pool, discovers total length, drives the
//! scheduler over the whole file, and persists the result.
//!
//! The checksum step is grounded in the teacher's `Downloader::verify_checksum`
//! (buffered SHA-256 over the written file); everything upstream of it —
//! dialing connections, discovering length from `Content-Range`, invoking
//! the scheduler — has no teacher counterpart and follows spec.md §2's
//! bootstrap responsibility directly.

use std::path::Path;
use std::time::Instant;

use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt as _;
use tracing::info;

use crate::bandwidth::init_global_start;
use crate::buffer::SharedBuffer;
use crate::connection::{Connection, MonitoredConnection};
use crate::error::MultigetError;
use crate::request::{parse_total_length, RangeSpec};
use crate::scheduler::{schedule, FirstResponse};

pub struct Outcome {
    pub length: u64,
    pub elapsed: std::time::Duration,
    pub sha256_hex: String,
}

/// Dials `servers` (host or host:port, port defaulting to 443), fetches
/// `target` with its length split across them, and writes the result to
/// `output`.
pub async fn run(
    target: &str,
    servers: &[(String, u16)],
    output: &Path,
) -> Result<Outcome, MultigetError> {
    init_global_start();
    let start_instant = Instant::now();

    let mut conns = Vec::with_capacity(servers.len());
    for (id, (host, port)) in servers.iter().enumerate() {
        let connection = Connection::dial(id as u32, host, *port).await?;
        conns.push(MonitoredConnection::new(connection).await);
    }

    info!(mirrors = conns.len(), target, "connections established");

    let (status, headers, body) = conns[0]
        .connection
        .start_request(target, RangeSpec::LeftOpen { start: 0 })
        .await?;
    if status != http::StatusCode::OK && status != http::StatusCode::PARTIAL_CONTENT {
        return Err(MultigetError::Protocol(format!(
            "bootstrap request returned unexpected status {status}"
        )));
    }
    let length = parse_total_length(&headers)?;
    info!(length, "total length discovered");

    let buf = SharedBuffer::new(length);
    schedule(
        target,
        &conns,
        None,
        0,
        length,
        &buf,
        Some(FirstResponse(body)),
    )
    .await?;

    let bytes = buf.into_inner();

    let mut file = tokio::fs::File::create(output)
        .await
        .map_err(|e| MultigetError::Setup(format!("cannot create {}: {e}", output.display())))?;
    file.set_len(bytes.len() as u64)
        .await
        .map_err(MultigetError::Io)?;
    file.write_all(&bytes).await.map_err(MultigetError::Io)?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256_hex = format!("{:x}", hasher.finalize());

    let elapsed = start_instant.elapsed();
    info!(
        length,
        elapsed_ms = elapsed.as_millis() as u64,
        sha256 = %sha256_hex,
        "download complete"
    );

    Ok(Outcome {
        length,
        elapsed,
        sha256_hex,
    })
}
