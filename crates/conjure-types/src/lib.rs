//! Conjure Types - Canonical domain types for the generation orchestration core
//!
//! This crate contains all foundational types for Conjure with zero dependencies
//! on other conjure crates. It defines the complete type system for:
//!
//! - Identity types (UserId, GenerationId, CastId, ChainEventId, etc.)
//! - Credit and USD amount types with checked arithmetic
//! - Generation records and their lifecycle
//! - Tool and spell definitions
//! - Deposit records and delivery intents
//! - Terminal events and the client-facing error taxonomy
//!
//! # Architectural Invariants
//!
//! These types support the core Conjure settlement invariants:
//!
//! 1. A user's balance never goes negative through an admitted debit
//! 2. Every generation settles (commit or release) exactly once
//! 3. Status transitions are monotonic toward a terminal state
//! 4. Every chain event credits the ledger at most once

pub mod identity;
pub mod amount;
pub mod generation;
pub mod tool;
pub mod spell;
pub mod deposit;
pub mod delivery;
pub mod event;
pub mod error;

pub use identity::*;
pub use amount::*;
pub use generation::*;
pub use tool::*;
pub use spell::*;
pub use deposit::*;
pub use delivery::*;
pub use event::*;
pub use error::*;

/// Version of the Conjure types schema
pub const TYPES_VERSION: &str = "0.1.0";
