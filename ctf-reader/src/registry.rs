//! Format registry
//!
//! The containing framework dispatches trace opens by format name. The
//! CTF format registers itself under `"ctf"` through an explicit
//! [`register`] call; there is no hidden static initialization.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use crate::error::Result;
use crate::stream::PacketSeekFn;
use crate::trace::{self, CtfTrace, OpenMode};

/// A trace format that can open directories by name
pub trait TraceFormat {
    fn name(&self) -> &'static str;

    fn open_trace(
        &self,
        path: &Path,
        mode: OpenMode,
        packet_seek: Option<PacketSeekFn>,
        metadata: Option<File>,
    ) -> Result<CtfTrace>;
}

/// The Common Trace Format
pub struct CtfFormat;

impl TraceFormat for CtfFormat {
    fn name(&self) -> &'static str {
        "ctf"
    }

    fn open_trace(
        &self,
        path: &Path,
        mode: OpenMode,
        packet_seek: Option<PacketSeekFn>,
        metadata: Option<File>,
    ) -> Result<CtfTrace> {
        trace::open_trace(path, mode, packet_seek, metadata)
    }
}

/// Registry of trace formats by name
#[derive(Default)]
pub struct FormatRegistry {
    formats: HashMap<&'static str, Box<dyn TraceFormat>>,
}

impl FormatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a format. Returns false when the name is already taken.
    pub fn register(&mut self, format: Box<dyn TraceFormat>) -> bool {
        let name = format.name();
        if self.formats.contains_key(name) {
            return false;
        }
        self.formats.insert(name, format);
        true
    }

    pub fn get(&self, name: &str) -> Option<&dyn TraceFormat> {
        self.formats.get(name).map(|format| format.as_ref())
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.formats.keys().copied()
    }
}

/// Register the formats of this crate; called once at library init.
pub fn register(registry: &mut FormatRegistry) {
    registry.register(Box::new(CtfFormat));
}
