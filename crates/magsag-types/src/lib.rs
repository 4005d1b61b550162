//! Shared data types for the MAGSAG agent runtime.
//!
//! Everything here is plain data: the run/event/delegation model, approval
//! tickets, snapshots, cost records, memory entries, handoff requests, and
//! the canonical-JSON hashing helpers every other crate funnels through.

pub mod canonical;
pub mod catalog;
pub mod context;
pub mod cost;
pub mod error;
pub mod event;
pub mod handoff;
pub mod memory;
pub mod pattern;
pub mod permissions;
pub mod run;
pub mod snapshot;

pub use canonical::{canonical_json, hash_args, sha256_hex};
pub use catalog::{AgentDescriptor, AgentRole};
pub use context::{Delegation, DelegationResult, DelegationStatus, ExecutionContext};
pub use cost::{CostBreakdown, CostRecord, CostSummary};
pub use error::{ApiError, ErrorCode, ValidationError};
pub use event::RuntimeEvent;
pub use handoff::{HandoffRequest, HandoffStatus, Platform};
pub use memory::{MemoryEntry, MemoryScope, PiiTag};
pub use pattern::wildcard_matches;
pub use permissions::{mask_tool_args, ApprovalTicket, TicketStatus, ToolPermission};
pub use run::{EventRecord, RunRecord, RunStatus};
pub use snapshot::RunSnapshot;
