//! Conjure Spells - Multi-step tool sequences
//!
//! A spell is a stored, versioned list of steps with data-flow between
//! them; a cast is one execution. The runner is event-driven: it starts a
//! step by handing a child generation to the execution engine, then waits
//! for the notification dispatcher to call [`SpellRunner::continue_cast`]
//! with the step's terminal generation. The runner never subscribes to the
//! engine directly and the engine never calls the runner; the dispatcher is
//! the only bridge.

pub mod book;
pub mod runner;

pub use book::{SpellBook, SpellRef};
pub use runner::{FieldMigrations, SpellRunner};

use thiserror::Error;

use conjure_types::BrokenBinding;

/// Errors from spell operations
#[derive(Debug, Clone, Error)]
pub enum SpellError {
    #[error("Spell not found: {reference}")]
    SpellNotFound { reference: String },

    #[error("Spell version {version} of {spell_id} already published")]
    VersionExists { spell_id: String, version: u32 },

    #[error("Cast not found: {cast_id}")]
    CastNotFound { cast_id: String },

    #[error("Invalid spell binding: {0}")]
    Binding(BrokenBinding),

    #[error("Parameter validation failed: {message}")]
    Parameters { message: String },

    #[error("Store error: {message}")]
    Store { message: String },

    #[error("Engine error: {message}")]
    Engine { message: String },
}

pub type Result<T> = std::result::Result<T, SpellError>;
