//! Core types and traits for the thoughtstore memory layer.
//!
//! This crate defines the thought/note entity model, the `Memory` capability
//! that storage backends implement, the cancellation context every operation
//! accepts, and the shared error type. It performs no storage I/O itself.

pub mod config;
pub mod context;
pub mod error;
pub mod memory;
pub mod thought;
