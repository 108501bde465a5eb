//! Workflow launcher: provisions a tool's inputs from pluggable storage
//! backends, runs the tool, and provisions its declared outputs.

pub mod backend;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod hash;
pub mod manifest;
pub mod provision;
pub mod registry;
pub mod runner;
