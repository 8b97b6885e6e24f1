pub use kfc_core::{KfcError as SchedulerError, Result};
