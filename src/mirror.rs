//! The abstraction the scheduler drives instead of a concrete TLS+HTTP/2
//! connection, so `schedule`/`split_and_transfer`/`supervise` can be
//! exercised against a fake mirror pool in tests (spec.md §8) rather than
//! real sockets — the same reason [`crate::rtt::PingSource`] exists.
//! Grounded in the same fake-client pattern `condow_core`'s downloader
//! machinery is tested against (see
//! `examples/other_examples/c2ccd61e_medwards-condow__condow_core-src-machinery-downloaders.rs.rs`).

use async_trait::async_trait;

use crate::bandwidth::BandwidthCounter;
use crate::error::{BodyOutcome, MultigetError};
use crate::request::RangeSpec;

/// A response stream for one mirror's range request. Production code
/// implements this over [`crate::connection::ResponseBody`] (an `h2`
/// `RecvStream`); tests implement it over a synthetic, rate-limited byte
/// source.
#[async_trait]
pub trait TransferBody: Send {
    fn choke_handle(&self) -> crate::connection::ChokeHandle;

    /// Reads up to `dest.len()` bytes into `dest`, feeding every chunk
    /// through `counter`.
    async fn read_into(
        self,
        dest: &mut [u8],
        counter: &BandwidthCounter,
    ) -> Result<BodyOutcome, MultigetError>;
}

/// One mirror connection, as the scheduler sees it: identity, a current RTT
/// estimate, and the ability to start a range request.
#[async_trait]
pub trait Mirror: Send + Sync {
    type Body: TransferBody;

    fn id(&self) -> u32;

    /// Current moving-average RTT in microseconds (spec.md §4.2); `0` means
    /// no sample is available yet.
    fn rtt_micros(&self) -> u64;

    async fn start_request(
        &self,
        path: &str,
        range: RangeSpec,
    ) -> Result<(http::StatusCode, Self::Body), MultigetError>;
}
