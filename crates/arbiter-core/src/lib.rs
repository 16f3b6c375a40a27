//! Arbiter Core Library
//!
//! Exclusive, named access to hardware resources shared by independent
//! processes on one host:
//! - Registry: one record per resource key in a shared lock directory
//! - Liveness probing to reclaim locks whose holder died
//! - A per-key lock state machine with try-once and timed acquisition
//! - Sessions with release on drop
//!
//! # Example
//!
//! ```no_run
//! use arbiter_core::Session;
//!
//! # fn main() -> arbiter_core::LockResult<()> {
//! let mut session = Session::new("readout", "#0")?;
//! if session.timed_start(5000)? {
//!     // talk to the device
//!     session.stop()?;
//! } else {
//!     eprintln!("Couldn't grab session lock");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Waiters are not queued: whichever claim reaches the registry first wins.

pub mod config;
pub mod error;
pub mod guard;
pub mod liveness;
pub mod machine;
pub mod record;
pub mod registry;
pub mod session;

pub use config::ArbiterConfig;
pub use error::{LockError, LockResult};
pub use guard::SessionGuard;
pub use liveness::{Liveness, LivenessProbe, ProcessProbe};
pub use machine::{LockState, ResourceLock};
pub use record::{HolderIdentity, HolderRecord};
pub use registry::{Claim, Reclaim, Registry, Release};
pub use session::{Arbiter, Session, SessionParameters};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::ArbiterConfig;
    pub use crate::error::{LockError, LockResult};
    pub use crate::session::{Arbiter, Session};
}
