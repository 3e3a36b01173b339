//! Foreground subprocess execution.
//!
//! Run a child process as if it were the foreground job: its standard
//! streams are shared with the parent or captured up to a byte cap, it is
//! killed on timeout or overflow, and signals the parent receives (and the
//! parent's imminent exit) are relayed to it for as long as it runs.
//!
//! ```no_run
//! # async fn demo() -> Result<(), fgexec::ExecError> {
//! let options = fgexec::ExecOptions {
//!     silent: true,
//!     ..Default::default()
//! };
//! let request = options.resolve("git", ["status", "--short"])?;
//! let result = fgexec::exec(&request).await?;
//! println!("{}", result.stdout().to_text_lossy());
//! # Ok(())
//! # }
//! ```

pub mod accumulator;
pub mod cli;
pub mod command;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod exec;
pub mod kill;
pub mod logging;
pub mod options;
pub mod reader;
pub mod relay;
pub mod request;
pub mod result;
pub mod run_summary;
pub mod signals;

pub use accumulator::{Encoding, Output, TextEncoding};
pub use error::{ErrorCode, ErrorKind, ExecError};
pub use events::{ParentEvent, ParentEvents, Subscription};
pub use exec::{Executor, ThrowPolicy, exec};
pub use options::{ExecOptions, OptionValue};
pub use reader::{ByteCap, StreamName};
pub use request::{ExecRequest, StdioMode};
pub use result::ExecResult;
