//! State Management Module
//!
//! Membership markers, lease-backed registration and the election loop
//! that derives leadership from the live membership.

pub mod membership;
pub mod registration;
pub mod election;

pub use membership::{MembershipSnapshot, fetch_snapshot, member_key, parse_member};
pub use registration::{Registration, register};
pub use election::{ElectionLoop, ElectionState, Leadership, LoopHealth};
