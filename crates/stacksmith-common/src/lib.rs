//! # stacksmith-common
//!
//! Shared building blocks for the stacksmith workspace:
//! - **Error**: the [`error::StacksmithError`] infrastructure error type
//!   that higher-level crates wrap with their own domain enums.
//! - **Constants**: default names, label keys, and tuning knobs used by
//!   the composition engine.

pub mod constants;
pub mod error;
