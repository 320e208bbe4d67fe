pub mod engine;
pub mod events;
pub mod expr;
pub mod gate;
pub mod lane;
pub mod machine;
pub mod output;
pub mod registry;
pub mod resolve;
pub mod retry;
pub mod stream;
pub mod transition;
pub mod validator;
pub mod variables;

pub use engine::{ListQuery, StartRequest, WorkflowEngine};
pub use events::EventLog;
pub use gate::GateController;
pub use machine::Execution;
pub use registry::{ExecutionRepository, InMemoryRepository};
pub use stream::{EventSubscription, ReplaySource};
pub use transition::Outcome;
pub use validator::{validate, CompiledWorkflow};
pub use variables::VariableStore;
