//! # farstore testkit
//!
//! Test utilities for farstore.
//!
//! This crate provides:
//! - [`MemoryServer`], an in-memory document store honoring the update and
//!   filter semantics of the remote service
//! - [`MemoryTransport`], a [`farstore_core::Transport`] over the memory
//!   server with failure injection
//! - Fixtures and client helpers for integration tests

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod server;
pub mod transport;

pub use fixtures::*;
pub use server::MemoryServer;
pub use transport::MemoryTransport;
