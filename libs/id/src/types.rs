//! Typed id definitions.
//!
//! `ActionId` names one in-flight scaling action; the state store conditions
//! every action mutation on it. `RequestId` names one invocation of the
//! control loop; the distributed lock records it as the owner.

use crate::define_id;

define_id!(ActionId, "act");
define_id!(RequestId, "req");
