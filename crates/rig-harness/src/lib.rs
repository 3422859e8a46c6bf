//! rig-harness - test-process side of the controller rig.
//!
//! Drives a controller application in an isolated child process: launch it,
//! poll it to readiness, execute steps over its RPC endpoint, and tear it
//! down, gracefully when possible and forcibly when not. The entry point is
//! [`ControllerSession`]; the other modules are its collaborators and are
//! public for tests and embedders that need finer control.

pub mod channel;
pub mod guard;
pub mod prober;
pub mod session;
pub mod supervisor;

pub use channel::{ChannelError, StepChannel};
pub use guard::TimeoutGuard;
pub use prober::{ProbeError, ReadinessProber};
pub use session::{
    ControllerSession, DirProvisioner, Provisioner, SessionConfig, SessionError, SessionState,
};
pub use supervisor::{ControllerProcess, LaunchError, LaunchPlan, TlsMaterial};

// Re-exported so test code can build steps without a direct rig-core dep.
pub use rig_core::failure::RemoteFailure;
pub use rig_core::step::StepEnvelope;
