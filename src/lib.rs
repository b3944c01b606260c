pub mod errors;
pub mod logging;
pub mod config;

pub mod calling;

// In-process doubles for the store and media layers
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use calling::{
    decline_incoming_call, initiate_group_call, join_group_call, start_direct_call, CallContext, CallEvent,
    CallHandle, DirectCallSession, GroupCallSession, IncomingCallDetector,
};
pub use config::CallConfig;
pub use errors::{CallError, Result};
