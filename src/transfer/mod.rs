//! Transfer execution: lftp command building, subprocess running, and the
//! directory → file fallback.

pub mod command;
pub mod executor;
pub mod runner;

pub use command::{Invocation, TransferMode};
pub use executor::{TransferExecutor, TransferOutcome, TransferStatus};
pub use runner::{CommandRunner, RunOutput, SearchPath, ShellRunner, ToolLocator};
