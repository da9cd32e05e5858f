pub mod admission;
pub mod dispatcher;
pub mod queue;
pub mod reporter;
pub mod retry;

pub use admission::{AdmissionController, PusherLimit};
pub use dispatcher::{DispatchEngine, EngineSettings, EngineSnapshot, Senders};
pub use queue::{JobQueue, SubmitError};
pub use reporter::{DispatchStats, LogReporter, ResultReporter};
pub use retry::RetryPolicy;
