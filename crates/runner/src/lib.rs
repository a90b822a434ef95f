//! Message pump for the transaction coordinator
//!
//! The coordinator itself never blocks. The [`Runner`] owns it, feeds it the
//! inbound queue in batches and does the periodic work between batches:
//! expiring participants, flushing the log and retrying deferred requests.

mod error;
mod runner;

pub use error::{Result, RunnerError};
pub use runner::Runner;
