//! MCP tool implementations.
//!
//! This module contains all tools exposed by the vault-host server.

pub mod cache;
