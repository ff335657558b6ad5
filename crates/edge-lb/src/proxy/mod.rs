//! Origin dispatch: failover across the pool, header forwarding, and request IDs.

pub mod correlation;
pub mod failover;
pub mod forward;
