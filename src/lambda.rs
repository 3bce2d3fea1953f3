//! Filter process supervision.
//!
//! The "lambda" is the user-supplied shell command that transforms the raw
//! audio bytes. It is spawned once per bridge with its stdin/stdout wired
//! to two non-blocking pipes and terminated exactly once at teardown.

pub mod process;

pub use process::LambdaProcess;
