pub use kfc_core::{KfcError as SessionError, Result};
