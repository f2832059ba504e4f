//! Persistence backends for finished runs.

pub mod tsv_writer;

pub use tsv_writer::{default_tag, format_scientific, TsvWriter};
