//! Wire-level plumbing for covey groups.
//!
//! - [`protocol`]: the envelope codec and per-group topic names
//! - [`transport`]: the publish/subscribe substrate trait and an in-process broker
//! - [`http_transport`]: a client for an HTTP log proxy
//! - [`work_queue`]: the local queue that carries admitted work to the intake

pub mod http_transport;
pub mod protocol;
pub mod transport;
pub mod work_queue;
