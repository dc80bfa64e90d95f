//! Custom-metric computation.
//!
//! Turns the sample pairs collected by the scrape pipeline into per-pod
//! request rates, answering point ("by name") and selector queries. The
//! serving façade that exposes these values over an API is a separate
//! concern; this crate only computes.

mod provider;
pub mod selector;

pub use provider::{ObjectReference, PodMetricsProvider, ProviderError, RateValue, METRIC_NAME};
pub use selector::{LabelSelector, SelectorError};
