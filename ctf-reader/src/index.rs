//! Packet indexer
//!
//! Walks a stream file packet by packet at open, validating each packet
//! header against the trace (magic, uuid, stream id) and recording where
//! every packet's content lives. The index drives all later seeks; the
//! stream file is never re-scanned.

use crate::decode::decode_struct_root;
use crate::def::{FieldDef, Scope, StructDef};
use crate::error::{CtfError, Result};
use crate::pos::{PacketIndexEntry, MAX_PACKET_HEADER_BYTES};
use crate::stream::{FileStream, SeekWhence};
use crate::trace::TraceMeta;

/// Magic number carried by stream packet headers that declare one
pub const CTF_MAGIC: u32 = 0xC1FC_1FC1;

fn fields_opt(def: &Option<StructDef>) -> &[FieldDef] {
    def.as_ref().map(|s| s.fields.as_slice()).unwrap_or(&[])
}

/// Build the packet index for one stream file, resolving its stream
/// class from the first packet, then park the cursor on packet 0.
pub(crate) fn build_packet_index(meta: &TraceMeta, fs: &mut FileStream) -> Result<()> {
    let file_size = fs.pos.file_size();
    let file_bits = file_size * 8;
    let mut first_packet = true;
    let mut mmap_offset = 0u64;

    while mmap_offset < file_size {
        // Window large enough for any header and context, clamped to the
        // file tail.
        let window = (file_size - mmap_offset).min(MAX_PACKET_HEADER_BYTES);
        fs.pos.map_window(mmap_offset, window)?;
        fs.pos.packet_size = window * 8;
        fs.pos.content_size = window * 8;
        fs.pos.set_offset(0);

        let mut entry = PacketIndexEntry {
            offset: mmap_offset,
            content_size: 0,
            packet_size: 0,
            timestamp_begin: 0,
            timestamp_end: 0,
            data_offset: 0,
            events_discarded: 0,
        };
        let mut stream_id = 0u64;

        if let Some(decl) = meta.packet_header {
            let header = decode_struct_root(&meta.arena, decl, &mut fs.pos, None)?;

            if let Some(magic) = header.unsigned_field("magic") {
                if magic != u64::from(CTF_MAGIC) {
                    return Err(CtfError::BadMagic {
                        found: magic,
                        packet: fs.pos.packet_count(),
                        offset: mmap_offset,
                    });
                }
            }

            if let Some(uuid_field) = header.field("uuid") {
                let bytes = uuid_field
                    .as_bytes()
                    .ok_or_else(|| CtfError::decode("packet header uuid is not a byte array"))?;
                if bytes.as_slice() != meta.uuid.as_bytes() {
                    return Err(CtfError::UuidMismatch);
                }
            }

            if let Some(id) = header.unsigned_field("stream_id") {
                stream_id = id;
            }

            fs.trace_packet_header = Some(header);
        }

        if first_packet {
            fs.stream_id = stream_id;
            let class = meta
                .stream_class(stream_id)
                .ok_or(CtfError::UnknownStream(stream_id))?;
            fs.events = (0..class.events.len()).map(|_| None).collect();
        } else if stream_id != fs.stream_id {
            return Err(CtfError::StreamIdChange {
                expected: fs.stream_id,
                found: stream_id,
            });
        }
        first_packet = false;

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

            entry.content_size = context.unsigned_field("content_size").unwrap_or(file_bits);
            entry.packet_size = context.unsigned_field("packet_size").unwrap_or_else(|| {
                if entry.content_size != 0 {
                    entry.content_size
                } else {
                    file_bits
                }
            });
            entry.timestamp_begin = context.unsigned_field("timestamp_begin").unwrap_or(0);
            entry.timestamp_end = context.unsigned_field("timestamp_end").unwrap_or(0);
            entry.events_discarded = context.unsigned_field("events_discarded").unwrap_or(0);
            fs.stream_packet_context = Some(context);
        } else {
            entry.content_size = file_bits;
            entry.packet_size = file_bits;
        }

        let remaining_bits = (file_size - mmap_offset) * 8;
        if entry.content_size > entry.packet_size || entry.packet_size > remaining_bits {
            return Err(CtfError::BadPacketSize {
                content_bits: entry.content_size,
                packet_bits: entry.packet_size,
                remaining_bits,
            });
        }
        if entry.packet_size < 8 {
            // A packet shorter than a byte cannot even advance the walk.
            return Err(CtfError::BadPacketSize {
                content_bits: entry.content_size,
                packet_bits: entry.packet_size,
                remaining_bits,
            });
        }

        entry.data_offset = fs
            .pos
            .offset()
            .ok_or_else(|| CtfError::decode("cursor lost during packet indexing"))?;

        fs.pos.packet_index.push(entry);
        mmap_offset += entry.packet_size / 8;
    }

    // Prime the first packet for reading.
    let seek = fs.packet_seek;
    seek(meta, fs, 0, SeekWhence::Set)
}
