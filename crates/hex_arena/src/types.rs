//! Identifier aliases shared across the core.

/// Player identity within a single session, assigned at creation.
pub type PlayerId = i64;

/// External user identity, owned by the (out-of-scope) account system.
pub type UserId = i64;

/// Dense event log identifier.
pub type EventId = u64;

/// Round counter, starting at 1.
pub type Round = u64;
