pub mod error;
pub mod mental_log;
pub mod models;
pub mod session;

pub use mental_log::{MentalLog, MentalLogEntry};
pub use models::{ActionRecord, EventKind, ToolCallResult, WaitingConfig};
pub use session::{NullBackingStore, Session, SessionBackingStore, SessionSnapshot, SessionStore};
