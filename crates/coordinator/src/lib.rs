//! Transaction manager: two-phase commit across resource managers
//!
//! The [`Coordinator`] drives commit and rollback of distributed
//! transactions. It learns which resources take part in a transaction from
//! involvement announcements, runs prepare, logs the decision and drives
//! commit or rollback, answering the caller exactly once. After a restart
//! [`Coordinator::recover`] picks up every logged decision that has not
//! completed.

pub mod config;
pub mod coordinator;
pub mod correlation;
pub mod error;
pub mod pending;
mod recovery;
pub mod resource;
pub mod transaction;

pub use config::{CoordinatorConfig, ProxyConfig, ResourceProperty};
pub use coordinator::{Coordinator, Handled};
pub use correlation::{Closed, CorrelationTracker, Origin, Progress, ReplyTo};
pub use error::{CoordinatorError, Result};
pub use pending::{Delivery, Request, RequestQueue, Route, Router, Target};
pub use resource::{InstanceId, InstanceState, ResourceRegistry, Statistics};
pub use transaction::{Lookup, Stage, TransactionRegistry};
