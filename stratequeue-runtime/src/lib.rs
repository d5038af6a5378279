//! Live trading runtime: clock, strategy runners, and the supervisor.
//!
//! Composition root for the pipeline `data manager -> signal engine ->
//! portfolio -> order gateway`, one task per concern, connected by typed
//! channels. The supervisor is the control plane's only entry point.

pub mod clock;
pub mod runner;
pub mod shutdown;
pub mod supervisor;

pub use clock::{spawn_tick_stream, Clock, ManualClock, SystemClock, Tick};
pub use runner::{RunnerConfig, RunnerEvent, StopOptions};
pub use shutdown::ShutdownSignal;
pub use supervisor::{
    DeploySpec, StrategySnapshot, Supervisor, SupervisorConfig, SupervisorDeps, SupervisorError,
    SupervisorHandle,
};
