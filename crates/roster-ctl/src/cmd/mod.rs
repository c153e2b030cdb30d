//! CLI command modules.

pub mod find;
pub mod http;
pub mod status;
