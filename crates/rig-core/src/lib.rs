pub mod failure;
pub mod protocol;
pub mod step;
pub mod token;

pub use failure::RemoteFailure;
pub use protocol::*;
pub use step::{StepContext, StepEnvelope, StepFailure, StepFn, StepRegistry};
pub use token::Token;
