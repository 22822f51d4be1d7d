//! Lifecycle plumbing shared by covey components: cooperative shutdown
//! signalling and scopes that own a set of background tasks.

pub mod shutdown;
