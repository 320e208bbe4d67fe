pub mod config;
pub mod definition;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use definition::WorkflowDefinition;
pub use error::{ErrorKind, Result, WeaverError};
pub use event::{EventKind, ExecutionEvent, StreamFrame};
pub use traits::{AgentRequest, AgentRunner, RunnerChunk};
pub use types::*;
