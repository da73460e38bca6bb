//! File streams: packet seek and the event reader
//!
//! A file stream couples a bit-level cursor with the materialized
//! definitions of its stream class and the running clock state. Crossing
//! a packet boundary remaps the cursor, replays the packet header and
//! context definitions, and accounts for events the tracer discarded at
//! that boundary.

use std::fs::File;
use std::io::{self, Write};

use crate::bitfield;
use crate::clock::{self, ClockDecl, ClockDisplay};
use crate::decode::decode_struct_root;
use crate::def::{Definition, FieldDef, IntDef, Scope, StructDef};
use crate::error::{CtfError, Result};
use crate::pos::StreamPos;
use crate::trace::TraceMeta;

/// Seek origin for [`packet_seek`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    /// Seek to the packet with the given index
    Set,
    /// Advance to the next packet
    Current,
}

/// Packet seek strategy; the default walks the packet index built at
/// open. Live sources may substitute their own.
pub type PacketSeekFn = fn(&TraceMeta, &mut FileStream, usize, SeekWhence) -> Result<()>;

/// Materialized per-event definitions, parallel to the event class table
#[derive(Debug, Default)]
pub struct EventDefs {
    pub context: Option<StructDef>,
    pub fields: Option<StructDef>,
}

/// One open stream file and its decode state
pub struct FileStream {
    pub(crate) pos: StreamPos,
    pub(crate) stream_id: u64,
    pub(crate) trace_packet_header: Option<StructDef>,
    pub(crate) stream_packet_context: Option<StructDef>,
    pub(crate) stream_event_header: Option<StructDef>,
    pub(crate) stream_event_context: Option<StructDef>,
    pub(crate) events: Vec<Option<EventDefs>>,
    /// Reconstructed 64-bit clock value of the last event
    pub(crate) timestamp: u64,
    pub(crate) prev_timestamp: u64,
    pub(crate) prev_timestamp_end: u64,
    /// Events discarded at the most recent packet boundary
    pub(crate) events_discarded: u64,
    pub(crate) event_id: u64,
    pub(crate) has_timestamp: bool,
    pub(crate) consumed: bool,
    /// Set once the stream joins an open trace; gates the end-of-stream
    /// discard warning, which indexing must not emit.
    pub(crate) in_collection: bool,
    pub(crate) packet_seek: PacketSeekFn,
}

impl FileStream {
    pub(crate) fn new(file: File, packet_seek: PacketSeekFn) -> Result<Self> {
        Ok(FileStream {
            pos: StreamPos::new(file)?,
            stream_id: 0,
            trace_packet_header: None,
            stream_packet_context: None,
            stream_event_header: None,
            stream_event_context: None,
            events: Vec::new(),
            timestamp: 0,
            prev_timestamp: 0,
            prev_timestamp_end: 0,
            events_discarded: 0,
            event_id: 0,
            has_timestamp: false,
            consumed: false,
            in_collection: false,
            packet_seek,
        })
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub fn pos(&self) -> &StreamPos {
        &self.pos
    }

    /// Id of the most recently read event
    pub fn event_id(&self) -> u64 {
        self.event_id
    }

    /// Current reconstructed 64-bit timestamp, at clock frequency
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn has_timestamp(&self) -> bool {
        self.has_timestamp
    }

    /// Events discarded at the last crossed packet boundary
    pub fn events_discarded(&self) -> u64 {
        self.events_discarded
    }

    pub fn packet_header(&self) -> Option<&StructDef> {
        self.trace_packet_header.as_ref()
    }

    pub fn packet_context(&self) -> Option<&StructDef> {
        self.stream_packet_context.as_ref()
    }

    pub fn event_header(&self) -> Option<&StructDef> {
        self.stream_event_header.as_ref()
    }

    pub fn event_context(&self) -> Option<&StructDef> {
        self.stream_event_context.as_ref()
    }

    /// Definitions of the most recently read event with the given id
    pub fn event(&self, id: u64) -> Option<&EventDefs> {
        self.events.get(id as usize)?.as_ref()
    }

    /// Mark the current event as consumed by the caller.
    pub fn mark_consumed(&mut self) {
        self.consumed = true;
    }

    /// Whether the caller has consumed the current event
    pub fn consumed(&self) -> bool {
        self.consumed
    }
}

fn fields_opt(def: &Option<StructDef>) -> &[FieldDef] {
    def.as_ref().map(|s| s.fields.as_slice()).unwrap_or(&[])
}

/// Update the stream clock from an event header timestamp field,
/// reconstructing wrap-arounds of sub-64-bit clocks.
pub(crate) fn update_timestamp(fs: &mut FileStream, len: u32, value: u64) {
    if len == 64 {
        fs.timestamp = value;
        return;
    }
    // Compare low bits to detect a single wrap since the last event.
    let mask = bitfield::mask(len);
    let old_low = fs.timestamp & mask;
    let mut new_low = value;
    if new_low < old_low {
        new_low += 1u64 << len;
    }
    let updated = (fs.timestamp & !mask) + new_low;
    fs.prev_timestamp = fs.timestamp;
    fs.timestamp = updated;
}

/// End-of-stream discard warning, one line on the diagnostic stream.
pub(crate) fn report_discarded(
    w: &mut dyn Write,
    clock: Option<&ClockDecl>,
    display: &ClockDisplay,
    count: u64,
    begin: u64,
    end: u64,
) -> io::Result<()> {
    write!(
        w,
        "[warning] Tracer discarded {count} events at end of stream between ["
    )?;
    clock::write_timestamp(w, clock, begin, display)?;
    write!(w, "] and [")?;
    clock::write_timestamp(w, clock, end, display)?;
    writeln!(w, "]. You should consider increasing the buffer size.")
}

/// Default packet seek over the packet index.
///
/// `Current` advances to the next packet, differencing the cumulative
/// discarded-event counter at the boundary; `Set` jumps to a packet and
/// resets the previous-timestamp bookkeeping. Either way the new packet
/// is mapped and its header and context definitions replayed. Empty
/// packets are skipped. Past the last packet the cursor parks at the
/// end-of-stream sentinel, reporting any pending discarded events.
pub fn packet_seek(
    meta: &TraceMeta,
    fs: &mut FileStream,
    index: usize,
    whence: SeekWhence,
) -> Result<()> {
    fs.pos.unmap();

    let mut whence = whence;
    loop {
        match whence {
            SeekWhence::Current => {
                if fs.pos.is_eof() {
                    return Ok(());
                }
                if let Some(entry) = fs.pos.packet_index.get(fs.pos.cur_index).copied() {
                    let mut discarded = entry.events_discarded;
                    fs.prev_timestamp_end = entry.timestamp_end;
                    if fs.pos.cur_index > 0 {
                        let prev = fs.pos.packet_index[fs.pos.cur_index - 1];
                        discarded = discarded.saturating_sub(prev.events_discarded);
                    }
                    fs.events_discarded = discarded;
                }
                fs.prev_timestamp = fs.timestamp;
                fs.pos.cur_index += 1;
            }
            SeekWhence::Set => {
                fs.pos.cur_index = index;
                fs.prev_timestamp = 0;
                fs.prev_timestamp_end = 0;
            }
        }

        if fs.pos.cur_index >= fs.pos.packet_count() {
            // End of stream: the discarded count has no next event to be
            // reported against, so report it here.
            if fs.events_discarded != 0 {
                if fs.in_collection {
                    let _ = report_discarded(
                        &mut io::stderr().lock(),
                        meta.clock.as_ref(),
                        &meta.display,
                        fs.events_discarded,
                        fs.prev_timestamp,
                        fs.prev_timestamp_end,
                    );
                }
                fs.events_discarded = 0;
            }
            fs.pos.set_eof();
            return Ok(());
        }

        let entry = fs.pos.packet_index[fs.pos.cur_index];
        fs.timestamp = entry.timestamp_begin;
        fs.pos.content_size = entry.content_size;
        fs.pos.packet_size = entry.packet_size;

        if entry.data_offset < entry.content_size {
            fs.pos.set_offset(0);
        } else if entry.data_offset == entry.content_size {
            // Empty packet: account for its boundary and move on.
            fs.pos.set_offset(entry.data_offset);
            whence = SeekWhence::Current;
            continue;
        } else {
            fs.pos.set_eof();
            return Ok(());
        }

        fs.pos
            .map_window(entry.offset, entry.packet_size.div_ceil(8))?;
        replay_packet_scopes(meta, fs)?;
        return Ok(());
    }
}

/// Re-decode the trace packet header and stream packet context of the
/// freshly mapped packet; their values feed the event reader's lookups.
fn replay_packet_scopes(meta: &TraceMeta, fs: &mut FileStream) -> Result<()> {
    if let Some(decl) = meta.packet_header {
        let header = decode_struct_root(&meta.arena, decl, &mut fs.pos, None)?;
        fs.trace_packet_header = Some(header);
    }
    let context_decl = meta
        .stream_class(fs.stream_id)
        .and_then(|class| class.packet_context);
    if let Some(decl) = context_decl {
        let context = {
            let FileStream {
                ref mut pos,
                ref trace_packet_header,
                ..
            } = *fs;
            let root = Scope::root(fields_opt(trace_packet_header));
            decode_struct_root(&meta.arena, decl, pos, Some(&root))?
        };
        fs.stream_packet_context = Some(context);
    }
    Ok(())
}

/// Align the cursor on the next event, crossing a packet boundary when
/// the current packet's content is exhausted.
fn pos_get_event(meta: &TraceMeta, fs: &mut FileStream) -> Result<()> {
    if let Some(offset) = fs.pos.offset() {
        debug_assert!(offset <= fs.pos.content_size);
        if offset == fs.pos.content_size {
            tracing::debug!(packet = fs.pos.cur_index, "reached end of packet");
            let seek = fs.packet_seek;
            seek(meta, fs, 0, SeekWhence::Current)?;
        }
    }
    Ok(())
}

/// Event header timestamp: a top-level `timestamp` integer, or one inside
/// the `v` variant's selected arm.
fn header_timestamp(header: &StructDef) -> Option<IntDef> {
    if let Some(int) = header.field("timestamp").and_then(Definition::as_integer) {
        return Some(int.clone());
    }
    header
        .field("v")
        .and_then(Definition::as_variant)
        .and_then(|v| v.value.as_struct())
        .and_then(|arm| arm.field("timestamp"))
        .and_then(Definition::as_integer)
        .cloned()
}

/// Event id from the header: an integer `id`, an enum `id`, or an
/// integer `id` inside the `v` variant's selected arm. Defaults to 0.
fn header_event_id(header: &StructDef) -> u64 {
    let mut id = 0;
    match header.field("id") {
        Some(Definition::Integer(i)) => id = i.value.as_unsigned(),
        Some(Definition::Enum(e)) => id = e.value.as_unsigned(),
        _ => {}
    }
    if let Some(inner) = header
        .field("v")
        .and_then(Definition::as_variant)
        .and_then(|v| v.value.as_struct())
        .and_then(|arm| arm.field("id"))
        .and_then(Definition::as_integer)
    {
        id = inner.value.as_unsigned();
    }
    id
}

/// Read the next event on the stream. Returns the event id, or `None` at
/// end of stream.
pub(crate) fn read_event(meta: &TraceMeta, fs: &mut FileStream) -> Result<Option<u64>> {
    // Empty files park the cursor at the sentinel before any read.
    if fs.pos.is_eof() {
        return Ok(None);
    }

    pos_get_event(meta, fs)?;

    // The position just reached is the restore point; the event is
    // consumed only once the caller says so.
    if let Some(offset) = fs.pos.offset() {
        fs.pos.last_offset = offset;
    }
    fs.consumed = false;

    if fs.pos.is_eof() {
        return Ok(None);
    }
    debug_assert!(fs.pos.offset().is_some_and(|o| o < fs.pos.content_size));

    let class = meta
        .stream_class(fs.stream_id)
        .ok_or(CtfError::UnknownStream(fs.stream_id))?;

    let mut id = 0u64;
    fs.has_timestamp = false;

    if let Some(header_decl) = class.event_header {
        let header = {
            let FileStream {
                ref mut pos,
                ref trace_packet_header,
                ref stream_packet_context,
                ..
            } = *fs;
            let s0 = Scope::root(fields_opt(trace_packet_header));
            let s1 = s0.child(fields_opt(stream_packet_context));
            decode_struct_root(&meta.arena, header_decl, pos, Some(&s1))?
        };
        id = header_event_id(&header);
        let timestamp = header_timestamp(&header);
        fs.stream_event_header = Some(header);
        if let Some(int) = timestamp {
            update_timestamp(fs, int.len, int.value.as_unsigned());
            fs.has_timestamp = true;
        }
    }
    fs.event_id = id;

    if let Some(context_decl) = class.event_context {
        let context = {
            let FileStream {
                ref mut pos,
                ref trace_packet_header,
                ref stream_packet_context,
                ref stream_event_header,
                ..
            } = *fs;
            let s0 = Scope::root(fields_opt(trace_packet_header));
            let s1 = s0.child(fields_opt(stream_packet_context));
            let s2 = s1.child(fields_opt(stream_event_header));
            decode_struct_root(&meta.arena, context_decl, pos, Some(&s2))?
        };
        fs.stream_event_context = Some(context);
    }

    let event_class = class
        .event(id)
        .ok_or(CtfError::InvalidEventId(id))?;

    let (context, fields) = {
        let FileStream {
            ref mut pos,
            ref trace_packet_header,
            ref stream_packet_context,
            ref stream_event_header,
            ref stream_event_context,
            ..
        } = *fs;
        let s0 = Scope::root(fields_opt(trace_packet_header));
        let s1 = s0.child(fields_opt(stream_packet_context));
        let s2 = s1.child(fields_opt(stream_event_header));
        let s3 = s2.child(fields_opt(stream_event_context));

        let context = match event_class.context {
            Some(decl) => Some(decode_struct_root(&meta.arena, decl, pos, Some(&s3))?),
            None => None,
        };
        let context_fields = context
            .as_ref()
            .map(|c| c.fields.as_slice())
            .unwrap_or(&[]);
        let s4 = s3.child(context_fields);
        let fields = match event_class.fields {
            Some(decl) => Some(decode_struct_root(&meta.arena, decl, pos, Some(&s4))?),
            None => None,
        };
        (context, fields)
    };

    if let Some(slot) = fs.events.get_mut(id as usize) {
        *slot = Some(EventDefs { context, fields });
    }

    Ok(Some(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_with_timestamp(initial: u64) -> FileStream {
        let file = tempfile::tempfile().unwrap();
        let mut fs = FileStream::new(file, packet_seek).unwrap();
        fs.timestamp = initial;
        fs
    }

    #[test]
    fn test_update_timestamp__full_width__then_replaced() {
        let mut fs = stream_with_timestamp(0xFFFF_FFFF_0000_0000);
        update_timestamp(&mut fs, 64, 42);
        assert_eq!(fs.timestamp, 42);
    }

    #[test]
    fn test_update_timestamp__monotonic_low_bits__then_merged() {
        let mut fs = stream_with_timestamp(0x1_0000_0010);
        update_timestamp(&mut fs, 32, 0x20);
        assert_eq!(fs.timestamp, 0x1_0000_0020);
        assert_eq!(fs.prev_timestamp, 0x1_0000_0010);
    }

    #[test]
    fn test_update_timestamp__wrap_detected__then_high_bits_carry() {
        let mut fs = stream_with_timestamp(0xFFFF_FFF0);
        update_timestamp(&mut fs, 32, 0x5);
        assert_eq!(fs.timestamp, 0x1_0000_0005);
    }

    #[test]
    fn test_update_timestamp__sequence_with_wrap__then_monotonic() {
        // The 32-bit field sequence 0x10, 0xFFFFFFF0, 0x05 reconstructs
        // to 0x10, 0xFFFFFFF0, 0x100000005.
        let mut fs = stream_with_timestamp(0);
        let mut seen = Vec::new();
        for field in [0x10u64, 0xFFFF_FFF0, 0x5] {
            update_timestamp(&mut fs, 32, field);
            seen.push(fs.timestamp);
        }
        assert_eq!(seen, vec![0x10, 0xFFFF_FFF0, 0x1_0000_0005]);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_update_timestamp__small_clock__then_multiple_wraps_accumulate() {
        let mut fs = stream_with_timestamp(0);
        let fields = [0x8u64, 0x2, 0xC, 0x6];
        update_timestamp(&mut fs, 4, fields[0]);
        update_timestamp(&mut fs, 4, fields[1]);
        update_timestamp(&mut fs, 4, fields[2]);
        update_timestamp(&mut fs, 4, fields[3]);
        // Wraps at 0x2 and 0x6 each add 0x10.
        assert_eq!(fs.timestamp, 0x26);
    }

    #[test]
    fn test_report_discarded__format__then_counts_and_interval() {
        let mut out = Vec::new();
        let display = ClockDisplay {
            seconds: true,
            ..Default::default()
        };
        report_discarded(&mut out, None, &display, 3, 1_000_000_000, 2_000_000_000).unwrap();
        let line = String::from_utf8(out).unwrap();
        assert!(line.starts_with("[warning] Tracer discarded 3 events at end of stream"));
        assert!(line.contains("[  1.000000000] and [  2.000000000]"));
        assert!(line.ends_with("increasing the buffer size.\n"));
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn test_header_event_id__integer_then_enum_then_variant__then_priority() {
        use crate::def::{EnumDef, IntValue, VariantDef};

        let plain = StructDef {
            fields: vec![FieldDef {
                name: "id".into(),
                value: crate::def::int_def(IntValue::Unsigned(7), 16, 10),
            }],
        };
        assert_eq!(header_event_id(&plain), 7);

        let as_enum = StructDef {
            fields: vec![FieldDef {
                name: "id".into(),
                value: Definition::Enum(EnumDef {
                    value: IntValue::Unsigned(9),
                    label: Some("extended".into()),
                }),
            }],
        };
        assert_eq!(header_event_id(&as_enum), 9);

        let with_variant = StructDef {
            fields: vec![
                FieldDef {
                    name: "id".into(),
                    value: Definition::Enum(EnumDef {
                        value: IntValue::Unsigned(31),
                        label: Some("extended".into()),
                    }),
                },
                FieldDef {
                    name: "v".into(),
                    value: Definition::Variant(Box::new(VariantDef {
                        tag_label: "extended".into(),
                        arm: "extended".into(),
                        value: Definition::Struct(StructDef {
                            fields: vec![FieldDef {
                                name: "id".into(),
                                value: crate::def::int_def(IntValue::Unsigned(200), 32, 10),
                            }],
                        }),
                    })),
                },
            ],
        };
        // The id inside the selected arm overrides the tag value.
        assert_eq!(header_event_id(&with_variant), 200);
    }

    #[test]
    fn test_header_timestamp__nested_in_variant__then_found() {
        use crate::def::{IntValue, VariantDef};

        let header = StructDef {
            fields: vec![FieldDef {
                name: "v".into(),
                value: Definition::Variant(Box::new(VariantDef {
                    tag_label: "compact".into(),
                    arm: "compact".into(),
                    value: Definition::Struct(StructDef {
                        fields: vec![FieldDef {
                            name: "timestamp".into(),
                            value: crate::def::int_def(IntValue::Unsigned(77), 27, 10),
                        }],
                    }),
                })),
            }],
        };
        let int = header_timestamp(&header).unwrap();
        assert_eq!(int.len, 27);
        assert_eq!(int.value.as_unsigned(), 77);
    }
}
