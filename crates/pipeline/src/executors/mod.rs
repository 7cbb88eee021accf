//! Bundled [`StageExecutor`](forge_core::executor::StageExecutor)
//! implementations.

mod command;
mod passthrough;

pub use command::CommandExecutor;
pub use passthrough::PassthroughExecutor;
