//! Process-level wiring shared by the controller and the agent.

use error_stack::Report;

mod tasks;

pub use tasks::Tasks;

/// Flattens a report, with its attachments, into an `anyhow` error for the
/// command runners.
pub fn into_anyhow<C>(report: Report<C>) -> anyhow::Error {
    anyhow::anyhow!("{report:?}")
}
