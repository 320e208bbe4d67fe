//! Shared test utilities for Weaver crates.
//!
//! `ScriptedRunner` plays back a per-node script instead of spawning an
//! agent; the fixture builders produce small workflows covering the common
//! graph shapes.

mod fixtures;
mod runner;

pub use fixtures::*;
pub use runner::{Script, ScriptedRunner, Step};

use std::io::Write;

/// Write `content` to a temporary `.toml` file kept alive by the returned handle.
pub fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("create temp config");
    file.write_all(content.as_bytes()).expect("write temp config");
    file
}
