//! External service clients.
//!
//! A client is an out-of-scope collaborator (database connection, object
//! store, remote scheduler). The engine never drives one directly; it only
//! surfaces the task's client to hooks and diagnostics.

use std::fmt;

/// Handle to an external service a task or product talks to.
pub trait Client: fmt::Debug + Send + Sync {
    /// Short identifier used in hook args and status rows.
    fn name(&self) -> &str;
}
