//! Group coordination for covey agents.
//!
//! The [`membership::MembershipManager`] owns the roster and the heartbeat
//! lifecycle. The [`router::GroupRouter`] demultiplexes inbound envelopes,
//! and every unit of work, local or from the group, goes through
//! [`intake::TaskIntake`] so that an idempotency key is executed at most once.

pub mod correlator;
pub mod delivery;
pub mod group_tasks;
pub mod intake;
pub mod membership;
pub mod processor;
pub mod roster;
pub mod router;
