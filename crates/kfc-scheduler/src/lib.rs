//! `kfc-scheduler` — the two background tasks that keep a dialogue stream
//! moving between the host's scheduler ticks: a wait-progress checker that
//! injects continuous-thinking updates while a reply is pending, and a
//! proactive-conversation trigger that occasionally starts a new one.
//!
//! Both run as a `tokio::select!` loop against a fixed interval and a
//! `watch::Receiver<bool>` shutdown signal, iterating the stream IDs
//! currently cached in a [`kfc_sessions::SessionStore`] rather than any
//! separate job table.

pub mod error;
pub mod proactive;
pub mod wait_checker;

pub use error::{Result, SchedulerError};
pub use proactive::ProactiveThinker;
pub use wait_checker::WaitChecker;
