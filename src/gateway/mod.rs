//! Usage: Local HTTP serving for bundled web assets.

pub mod static_files;
