//! Long-running covey agent.
//!
//! - Joins the configured group and keeps the roster fresh
//! - Routes group envelopes into the local intake queue
//! - Executes tasks exactly once per idempotency key
//! - Delivers finished group work back to requesters

pub mod daemon;
pub mod processor;
