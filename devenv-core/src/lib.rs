//! Foundation crate for the devenv orchestrator.
//!
//! Holds what every other layer needs: the error taxonomy, an injectable clock,
//! working-volume references and the keyed lock table that serializes work
//! per environment.

pub mod clock;
pub mod error;
pub mod locks;
pub mod volume;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DevEnvError, ErrorKind, ErrorSummary, Result};
pub use locks::{KeyedGuard, KeyedLocks};
pub use volume::VolumeRef;
