//! CLI command implementations; each returns data for the binary to print.

mod profile_cmd;

pub use profile_cmd::*;
