//! Trace opener
//!
//! Opens a CTF trace directory: reads and parses the `metadata` file,
//! builds the stream-class table, then indexes every stream file in the
//! directory. All resources are released when the [`CtfTrace`] drops,
//! whether the open succeeded or not.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::clock::{ClockDecl, ClockDisplay};
use crate::decl::{ByteOrder, DeclArena, DeclId};
use crate::error::{CtfError, Result};
use crate::index::build_packet_index;
use crate::metadata::{self, check_version};
use crate::stream::{self, FileStream, PacketSeekFn};
use crate::tsdl;

/// Name of the metadata file inside a trace directory
pub const METADATA_FILENAME: &str = "metadata";

/// Access mode requested at open; only reading is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    ReadWrite,
}

/// One event class within a stream class
#[derive(Debug)]
pub struct EventClass {
    pub id: u64,
    pub name: Option<String>,
    pub(crate) context: Option<DeclId>,
    pub(crate) fields: Option<DeclId>,
}

/// Shared declarations for all file streams with one stream id
#[derive(Debug)]
pub struct StreamClass {
    pub id: u64,
    pub(crate) packet_context: Option<DeclId>,
    pub(crate) event_header: Option<DeclId>,
    pub(crate) event_context: Option<DeclId>,
    pub(crate) events: Vec<Option<EventClass>>,
    /// Indices into the trace's file-stream table
    pub(crate) file_streams: Vec<usize>,
}

impl StreamClass {
    pub fn event(&self, id: u64) -> Option<&EventClass> {
        self.events.get(id as usize)?.as_ref()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn file_streams(&self) -> &[usize] {
        &self.file_streams
    }
}

/// Immutable, trace-wide state shared by every file stream
pub struct TraceMeta {
    pub(crate) arena: DeclArena,
    pub(crate) byte_order: ByteOrder,
    pub(crate) uuid: Uuid,
    pub(crate) packet_header: Option<DeclId>,
    pub(crate) streams: Vec<Option<StreamClass>>,
    pub(crate) clock: Option<ClockDecl>,
    pub(crate) display: ClockDisplay,
    pub(crate) env: Vec<(String, String)>,
}

impl TraceMeta {
    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn clock(&self) -> Option<&ClockDecl> {
        self.clock.as_ref()
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn stream_class(&self, id: u64) -> Option<&StreamClass> {
        self.streams.get(id as usize)?.as_ref()
    }

    pub fn stream_classes(&self) -> impl Iterator<Item = &StreamClass> {
        self.streams.iter().filter_map(Option::as_ref)
    }

    pub fn arena(&self) -> &DeclArena {
        &self.arena
    }
}

/// A successfully read event, positioned on its stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub stream_index: usize,
    pub stream_id: u64,
    pub id: u64,
    /// Reconstructed 64-bit timestamp, when the event header carried one
    pub timestamp: Option<u64>,
}

/// An opened trace directory
pub struct CtfTrace {
    pub(crate) meta: TraceMeta,
    pub(crate) file_streams: Vec<FileStream>,
    path: PathBuf,
}

impl CtfTrace {
    /// Open a trace directory read-only with the default packet seek.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        open_trace(path.as_ref(), OpenMode::Read, None, None)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn meta(&self) -> &TraceMeta {
        &self.meta
    }

    /// Configure how this trace renders timestamps in diagnostics.
    pub fn set_clock_display(&mut self, display: ClockDisplay) {
        self.meta.display = display;
    }

    pub fn stream_count(&self) -> usize {
        self.file_streams.len()
    }

    pub fn stream(&self, index: usize) -> Option<&FileStream> {
        self.file_streams.get(index)
    }

    /// Name of an event class, resolved through its stream class.
    pub fn event_name(&self, stream_id: u64, event_id: u64) -> Option<&str> {
        self.meta
            .stream_class(stream_id)?
            .event(event_id)?
            .name
            .as_deref()
    }

    /// Read the next event from one file stream, in file order.
    ///
    /// Returns `None` once the stream is exhausted. A decode failure
    /// aborts the current event; the cursor is not guaranteed to be
    /// usable for further reading.
    pub fn read_event(&mut self, stream_index: usize) -> Result<Option<Event>> {
        let meta = &self.meta;
        let fs = self
            .file_streams
            .get_mut(stream_index)
            .ok_or_else(|| CtfError::decode("stream index out of range"))?;
        match stream::read_event(meta, fs)? {
            None => Ok(None),
            Some(id) => Ok(Some(Event {
                stream_index,
                stream_id: fs.stream_id,
                id,
                timestamp: fs.has_timestamp.then_some(fs.timestamp),
            })),
        }
    }
}

impl std::fmt::Debug for CtfTrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CtfTrace")
            .field("path", &self.path)
            .field("uuid", &self.meta.uuid)
            .field("byte_order", &self.meta.byte_order)
            .field("file_streams", &self.file_streams.len())
            .finish()
    }
}

/// Assemble the stream-class table from parsed metadata.
fn build_stream_classes(parsed: &mut tsdl::ParsedMetadata) -> Result<Vec<Option<StreamClass>>> {
    let mut streams: Vec<Option<StreamClass>> = Vec::new();

    for spec in parsed.streams.drain(..) {
        let index = spec.id as usize;
        if streams.len() <= index {
            streams.resize_with(index + 1, || None);
        }
        if streams[index].is_some() {
            return Err(CtfError::metadata(format!(
                "duplicate stream id {}",
                spec.id
            )));
        }
        streams[index] = Some(StreamClass {
            id: spec.id,
            packet_context: spec.packet_context,
            event_header: spec.event_header,
            event_context: spec.event_context,
            events: Vec::new(),
            file_streams: Vec::new(),
        });
    }

    for spec in parsed.events.drain(..) {
        let class = streams
            .get_mut(spec.stream_id as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| {
                CtfError::metadata(format!(
                    "event {:?} declared for unknown stream {}",
                    spec.name.as_deref().unwrap_or(""),
                    spec.stream_id
                ))
            })?;
        let index = spec.id as usize;
        if class.events.len() <= index {
            class.events.resize_with(index + 1, || None);
        }
        if class.events[index].is_some() {
            return Err(CtfError::metadata(format!(
                "duplicate event id {} in stream {}",
                spec.id, spec.stream_id
            )));
        }
        class.events[index] = Some(EventClass {
            id: spec.id,
            name: spec.name,
            context: spec.context,
            fields: spec.fields,
        });
    }

    Ok(streams)
}

/// Read the metadata file and build the trace-wide state.
fn read_trace_meta(metadata_file: File) -> Result<TraceMeta> {
    let framed = metadata::read_metadata(BufReader::new(metadata_file))?;
    tracing::debug!(
        packet_framed = framed.packet_framed,
        byte_order = %framed.byte_order,
        "metadata read"
    );

    let framing_order = framed.packet_framed.then_some(framed.byte_order);
    let mut parsed = tsdl::parse(&framed.text, framing_order)?;

    if let (Some(major), Some(minor)) = (parsed.major, parsed.minor) {
        check_version(major as u32, minor as u32);
    }

    // The framing and the trace block must agree on the UUID; either may
    // be the only one to provide it.
    let uuid = match (framed.uuid, parsed.uuid) {
        (Some(framing), Some(declared)) if framing != declared => {
            return Err(CtfError::UuidMismatch)
        }
        (framing, declared) => framing.or(declared),
    };

    let streams = build_stream_classes(&mut parsed)?;

    Ok(TraceMeta {
        arena: parsed.arena,
        byte_order: parsed.byte_order,
        uuid: uuid.unwrap_or_else(Uuid::nil),
        packet_header: parsed.packet_header,
        streams,
        clock: parsed.clock,
        display: ClockDisplay::default(),
        env: parsed.env,
    })
}

/// Stream files of a trace directory: regular files that are neither
/// hidden nor the metadata, in name order.
fn stream_file_paths(path: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            CtfError::NotFound(path.to_path_buf())
        } else {
            CtfError::Io(e)
        }
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') || name == METADATA_FILENAME {
            continue;
        }
        if !entry.file_type()?.is_file() {
            continue;
        }
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}

/// Open a trace directory.
///
/// `packet_seek` overrides the default index-driven seek; `metadata`
/// substitutes an already-open metadata file for the one in the
/// directory.
pub fn open_trace(
    path: &Path,
    mode: OpenMode,
    packet_seek: Option<PacketSeekFn>,
    metadata: Option<File>,
) -> Result<CtfTrace> {
    if mode != OpenMode::Read {
        return Err(CtfError::Io(io::Error::new(
            io::ErrorKind::Unsupported,
            "opening CTF traces for output is not supported",
        )));
    }

    let stream_paths = stream_file_paths(path)?;

    let metadata_file = match metadata {
        Some(file) => file,
        None => File::open(path.join(METADATA_FILENAME)).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                CtfError::NotFound(path.join(METADATA_FILENAME))
            } else {
                CtfError::Io(e)
            }
        })?,
    };
    let meta = read_trace_meta(metadata_file)?;

    let seek = packet_seek.unwrap_or(stream::packet_seek);
    let mut trace = CtfTrace {
        meta,
        file_streams: Vec::new(),
        path: path.to_path_buf(),
    };

    for stream_path in stream_paths {
        tracing::debug!(path = %stream_path.display(), "indexing stream file");
        let file = File::open(&stream_path)?;
        let mut fs = FileStream::new(file, seek)?;
        build_packet_index(&trace.meta, &mut fs)?;

        let index = trace.file_streams.len();
        let stream_id = fs.stream_id;
        trace.file_streams.push(fs);
        if let Some(class) = trace
            .meta
            .streams
            .get_mut(stream_id as usize)
            .and_then(Option::as_mut)
        {
            class.file_streams.push(index);
        }
    }

    // The streams join the collection only now: indexing must not report
    // discarded events, reading must.
    for fs in &mut trace.file_streams {
        fs.in_collection = true;
    }

    Ok(trace)
}

/// Open a trace from caller-provided stream files, for live sources that
/// bring their own mapping discipline. The metadata handle is required;
/// it cannot be discovered from a directory. Streams belong to stream
/// class 0 and carry no packet index, so a caller-provided seek drives
/// them.
pub fn open_mmap_trace(
    stream_files: Vec<File>,
    packet_seek: PacketSeekFn,
    metadata: File,
) -> Result<CtfTrace> {
    let meta = read_trace_meta(metadata)?;

    let mut trace = CtfTrace {
        meta,
        file_streams: Vec::new(),
        path: PathBuf::new(),
    };

    for file in stream_files {
        let mut fs = FileStream::new(file, packet_seek)?;
        let class = trace
            .meta
            .stream_class(0)
            .ok_or(CtfError::UnknownStream(0))?;
        fs.events = (0..class.events.len()).map(|_| None).collect();
        fs.in_collection = true;

        let index = trace.file_streams.len();
        trace.file_streams.push(fs);
        if let Some(class) = trace.meta.streams.get_mut(0).and_then(Option::as_mut) {
            class.file_streams.push(index);
        }
    }

    Ok(trace)
}

/// Close a trace, releasing every mapping and descriptor.
pub fn close_trace(trace: CtfTrace) {
    drop(trace);
}
