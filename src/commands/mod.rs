//! 命令层：后端操作的统一分发面与调用追踪

pub mod executor;
pub mod trace;

pub use executor::{CommandExecutor, DefaultCommandExecutor};
pub use trace::{CallRecord, CommandTrace};
