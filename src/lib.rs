//! Covey: cooperating peers share one rate/concurrency quota.
//!
//! Each [`QuotaPeer`] registers itself on a named channel in a shared
//! [`Backend`], and all peers on the channel divide the announced group
//! quota evenly between themselves. Admission (`start`/`end`) is decided
//! locally against the peer's current share; the group only talks when
//! membership or the target quota changes.
pub mod admission;
pub mod api;
pub mod backend;
pub mod cli;
pub mod clock;
pub mod coordinator;
pub mod error;
pub mod peer_id;
pub mod quota;
pub mod registry;
pub mod settings;

pub use admission::AdmissionController;
pub use backend::{Backend, MemoryBackend};
pub use coordinator::{QuotaPeer, RebalanceMessage};
pub use error::{CoveyError, Result};
pub use peer_id::PeerId;
pub use quota::{GroupIntent, Quota};
pub use settings::PeerSettings;
