pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod external;
pub mod freshness;
pub mod health;
pub mod io;
pub mod notifier;
pub mod process;
pub mod status;
pub mod terminal;
pub mod types;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;

pub use coordinator::{Coordinator, TaskOutcome, TaskReport, TaskTicket};
pub use error::{HandoffError, Result, TaskError};
pub use notifier::Notifier;
