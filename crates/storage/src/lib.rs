pub mod session;

pub use session::{Session, SessionInfo, SessionManager, SessionMessage};
