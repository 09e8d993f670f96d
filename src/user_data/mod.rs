pub mod events;
pub mod session;

pub use events::{InboundFrame, PositionRisk, UserDataEvent};
pub use session::{
    open_session, SessionCallbacks, SessionContext, SessionHandle, SessionOptions, SessionState,
    SessionTable, UserDataSession,
};
