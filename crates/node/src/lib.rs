//! Ratewatch daemon wiring.
//!
//! Assembles the registry, scrape pipeline, metric provider and endpoint
//! steering into one supervised process. The cluster-watch plumbing that
//! discovers targets and credentials is an external collaborator; it feeds
//! the process through [`Node::registry`].

pub mod api;
pub mod config;
pub mod node;
pub mod supervisor;

pub use config::{ConfigOverrides, NodeConfig, RATEWATCH_NAMESPACE_ENV};
pub use node::Node;
pub use supervisor::{ShutdownError, SupervisedResult, Supervisor};
