pub mod dispatcher;
pub mod manager;
pub mod runtime;
pub mod store;
pub mod stream;

pub use dispatcher::{Dispatcher, DispatchResult, ExplicitSessionResolver, SessionSpawner};
pub use manager::{resume_target, NullSocketBinder, SessionError, SessionManager, SessionSocketBinder, SpawnRequest};
pub use runtime::{ContainerRuntime, ContainerStatus, FakeRuntime, ProcessRuntime, RunHandle, RuntimeError, SpawnOptions};
pub use store::ClaudeSessionStore;
pub use stream::{drain_stderr, drive_stdout, OutputEvent, StreamParser};
