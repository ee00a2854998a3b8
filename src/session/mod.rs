//! Session state machine and live-session bookkeeping

pub mod machine;
pub mod registry;

pub use machine::{Role, SessionAction, SessionEvent, SessionMachine, SessionState};
pub use registry::{SessionEntry, SessionRegistry};
