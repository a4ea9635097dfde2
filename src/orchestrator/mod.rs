//! Workflow orchestration: session state machine, controller loop, and the
//! ingestion job poller.

mod controller;
mod poller;
mod session;
#[cfg(test)]
pub(crate) mod testing;

pub(crate) use controller::{run_controller, WorkflowCommand};
pub(crate) use session::SEARCH_MIN_CHARS;
