//! Common Trace Format (CTF) trace reader
//!
//! Opens a CTF trace directory, parses its metadata description, indexes
//! the packets of every stream file, and decodes events in file order.
//!
//! ```no_run
//! use ctf_reader::CtfTrace;
//!
//! # fn main() -> ctf_reader::Result<()> {
//! let mut trace = CtfTrace::open("/path/to/trace")?;
//! while let Some(event) = trace.read_event(0)? {
//!     println!("event {} at {:?}", event.id, event.timestamp);
//! }
//! # Ok(())
//! # }
//! ```

pub mod bitfield;
pub mod clock;
pub mod decl;
pub mod decode;
pub mod def;
pub mod error;
pub mod index;
pub mod metadata;
pub mod pos;
pub mod registry;
pub mod stream;
pub mod trace;
pub mod tsdl;

pub use clock::{ClockDecl, ClockDisplay, NSEC_PER_SEC};
pub use decl::{ByteOrder, TypeClass};
pub use def::{Definition, IntValue, Scope, StructDef};
pub use error::{CtfError, Result};
pub use index::CTF_MAGIC;
pub use metadata::TSDL_MAGIC;
pub use pos::PacketIndexEntry;
pub use registry::{register, CtfFormat, FormatRegistry, TraceFormat};
pub use stream::{packet_seek, EventDefs, FileStream, PacketSeekFn, SeekWhence};
pub use trace::{
    close_trace, open_mmap_trace, open_trace, CtfTrace, Event, EventClass, OpenMode, StreamClass,
    TraceMeta,
};
