//! Metrics scraping pipeline.
//!
//! Tracks the apiserver pods recorded in a
//! [`Registry`](ratewatch_registry::Registry) and populates the registry
//! back with counter values scraped from the pods. The pipeline consists of
//! a cyclic [`queue::ScrapeQueue`] gated by a [`pacemaker::Pacemaker`], an
//! adaptive [`scraper::Scraper`] worker pool, and a tolerant text-format
//! [`parse`]r behind an HTTPS [`client`].

pub mod client;
pub mod error;
pub mod pacemaker;
pub mod parse;
pub mod queue;
pub mod scraper;

pub use client::{HttpMetricsClient, MetricsClient, DEFAULT_TLS_SERVER_NAME};
pub use error::{ParseError, ScrapeError};
pub use pacemaker::{Pacemaker, PacemakerConfig};
pub use parse::{sum_counter, DEFAULT_COUNTER_NAME};
pub use queue::{ScrapeQueue, ScrapeTarget};
pub use scraper::Scraper;
