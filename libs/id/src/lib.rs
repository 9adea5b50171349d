//! # smartscale-id
//!
//! Typed identifiers for the autoscaler.
//!
//! Scaling actions and control-loop invocations are persisted and compared by
//! id (the state store rejects writes whose action id does not match the
//! stored one, and the distributed lock is owned by a request id), so both
//! need a stable canonical string form with strict parsing.
//!
//! ## Format
//!
//! Every id is a prefixed ULID: `{prefix}_{ulid}`.
//!
//! - `act_01HV4Z2WQXKJNM8GPQY6VBKC3D` is a scaling action
//! - `req_01HV4Z3MXNKPQR9HSTZ7WCLD4E` is one invocation of the control loop
//!
//! ULIDs are time-ordered, so action ids sort by when the action started.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
