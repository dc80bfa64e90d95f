//! Scrape pipeline error types.

use thiserror::Error;

/// Errors from parsing a metrics response body.
#[derive(Debug, Error)]
pub enum ParseError {
    /// A line started with the counter name but did not follow the
    /// `name[{labels}] value` shape.
    #[error("malformed metrics line {line:?}")]
    Malformed { line: String },

    /// The response contained no series for the requested counter.
    #[error("the response contains no {counter:?} counters")]
    NoCountersFound { counter: String },

    /// Reading the (possibly gzip-compressed) body failed.
    #[error("reading metrics stream: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from a single scrape attempt.
#[derive(Debug, Error)]
pub enum ScrapeError {
    /// The scrape URL could not be parsed.
    #[error("invalid scrape url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Transport-level failure: connect, TLS handshake or body read.
    #[error("making http request: {0}")]
    Transport(#[from] reqwest::Error),

    /// The endpoint answered with a non-2xx status.
    #[error("response reported HTTP status {0}")]
    Status(u16),

    /// The response body could not be parsed.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// The per-scrape deadline elapsed.
    #[error("scrape deadline exceeded")]
    DeadlineExceeded,
}
