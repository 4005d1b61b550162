//! Scoped memory storage for agent context: session, long-term, and org
//! entries with TTL defaults, PII tagging, and an expiry sweep.

mod store;

pub use store::{MemoryError, MemoryStore};
