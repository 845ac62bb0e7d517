//! demograder library
//!
//! Core of a course-submission grader:
//! - A bounded-concurrency job queue that runs every job in its own process
//! - Dependency resolution from a submission to its upstream submission sets
//! - A sandbox runner for untrusted evaluation scripts
//! - The evaluation pipeline tying them together, and its MCP front end

pub mod config;
pub mod error;
pub mod evaluation;
pub mod mcp;
pub mod queue;
pub mod resolver;
pub mod sandbox;
pub mod store;
pub mod transport;
pub mod worker;
