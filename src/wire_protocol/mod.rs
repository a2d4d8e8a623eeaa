//! The subset of the MongoDB wire protocol needed to run commands.
pub mod flags;
pub mod header;
pub mod operations;
