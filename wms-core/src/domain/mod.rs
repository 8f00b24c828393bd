//! Domain rules: job status machine, description compiler, status decision,
//! priority arithmetic and the sandbox hook.

pub mod decision;
pub mod jdl;
pub mod priority;
pub mod sandbox;
pub mod status;

pub use decision::{StateMachineDecider, StatusDecider, StatusDecision};
pub use jdl::{CompiledJob, DescriptionCompiler, JdlCompiler, JobDescription, JobOwner};
pub use priority::{PriorityCalculator, ShareProportionalCalculator};
pub use sandbox::{LoggingSandboxUnassigner, SandboxUnassigner};
pub use status::JobStatus;
