//! # Groundwork Core
//!
//! Runtime-agnostic logic for Groundwork: data models, sentence-boundary
//! segment splitting, citation-grounding verification, the store
//! abstraction, and the retrieval algorithm.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem dependencies.

pub mod models;
pub mod retrieve;
pub mod segment;
pub mod store;
pub mod verify;
