//! Core IR definitions for the Viper AArch64 backend.
//!
//! This crate holds the two intermediate representations the code generator
//! works with:
//!
//! - [`il`]: the typed, SSA-shaped intermediate language produced by the
//!   frontends, together with its textual parser and structural checker.
//! - [`mir`]: the machine IR with virtual and physical register operands that
//!   the backend lowers into and ultimately serializes as assembly.

pub mod il;
pub mod mir;
