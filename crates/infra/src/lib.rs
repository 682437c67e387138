//! Infrastructure layer: job storage (in-memory and SQLite), shell execution
//! and the worker runtime.

pub mod jobs;
