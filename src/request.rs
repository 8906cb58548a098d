//! Request factory: the three GET shapes spec.md §4.4 names, and the
//! `Content-Range` parsing the bootstrap step needs to discover total
//! length.
//!
//! Wire-format decision (spec.md §9, resolved): HTTP ranges are inclusive
//! on the wire. The scheduler's half-open `[start, end)` is translated to
//! `bytes=start-(end-1)` when issuing a closed range, and the same
//! convention is used in reverse when parsing `Content-Range`.

use http::{HeaderMap, Request};

use crate::error::MultigetError;

/// The shape of `Range` header to send, mirroring spec.md §4.4.
#[derive(Debug, Clone, Copy)]
pub enum RangeSpec {
    /// No `Range` header. Used only if length discovery via left-ranged
    /// fails; the design prefers left-ranged with `start = 0`.
    Unranged,
    /// `Range: bytes=<start>-`. Used at bootstrap to start fetching while
    /// simultaneously learning total length from `Content-Range`.
    LeftOpen { start: u64 },
    /// `Range: bytes=<start>-<end-1>` on the wire for the half-open
    /// `[start, end)`. Used for all scheduler-issued subrange requests.
    Closed { start: u64, end: u64 },
}

/// Builds a GET request for `path` against `authority`, with the given
/// range header shape.
pub fn build_request(
    authority: &str,
    path: &str,
    range: RangeSpec,
) -> Result<Request<()>, MultigetError> {
    let uri = format!("https://{authority}{path}");
    let mut builder = Request::builder().method("GET").uri(uri);

    match range {
        RangeSpec::Unranged => {}
        RangeSpec::LeftOpen { start } => {
            builder = builder.header(http::header::RANGE, format!("bytes={start}-"));
        }
        RangeSpec::Closed { start, end } => {
            assert!(start <= end, "invalid range: start {start} > end {end}");
            let wire_end = end.saturating_sub(1);
            builder = builder.header(http::header::RANGE, format!("bytes={start}-{wire_end}"));
        }
    }

    builder.body(()).map_err(MultigetError::from)
}

/// Parses the total file length out of `Content-Range: bytes <a>-<b>/<total>`.
/// Fatal (spec.md §7 "Protocol errors") if the header is missing or
/// malformed.
pub fn parse_total_length(headers: &HeaderMap) -> Result<u64, MultigetError> {
    let value = headers
        .get(http::header::CONTENT_RANGE)
        .ok_or_else(|| MultigetError::Protocol("missing Content-Range header".into()))?
        .to_str()
        .map_err(|e| MultigetError::Protocol(format!("non-ASCII Content-Range: {e}")))?;

    let total = value
        .rsplit_once('/')
        .map(|(_, total)| total)
        .ok_or_else(|| MultigetError::Protocol(format!("malformed Content-Range: {value}")))?;

    total
        .parse::<u64>()
        .map_err(|e| MultigetError::Protocol(format!("malformed Content-Range total {total}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_range_is_inclusive_on_wire() {
        let req = build_request(
            "example.com:443",
            "/file",
            RangeSpec::Closed { start: 0, end: 100 },
        )
        .unwrap();
        assert_eq!(
            req.headers().get(http::header::RANGE).unwrap(),
            "bytes=0-99"
        );
    }

    #[test]
    fn left_open_range_has_no_end() {
        let req = build_request("example.com:443", "/file", RangeSpec::LeftOpen { start: 10 })
            .unwrap();
        assert_eq!(
            req.headers().get(http::header::RANGE).unwrap(),
            "bytes=10-"
        );
    }

    #[test]
    fn parses_total_length() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_RANGE, "bytes 0-999/10000".parse().unwrap());
        assert_eq!(parse_total_length(&headers).unwrap(), 10000);
    }

    #[test]
    fn missing_content_range_is_protocol_error() {
        let headers = HeaderMap::new();
        assert!(matches!(
            parse_total_length(&headers),
            Err(MultigetError::Protocol(_))
        ));
    }

    #[test]
    #[should_panic(expected = "invalid range")]
    fn closed_range_start_after_end_panics() {
        let _ = build_request(
            "example.com:443",
            "/file",
            RangeSpec::Closed { start: 10, end: 5 },
        );
    }
}
