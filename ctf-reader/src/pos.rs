//! Bit-level stream position over memory-mapped packet windows
//!
//! One [`StreamPos`] per stream file. Exactly one mapping is live at any
//! time; seeking to another packet drops the old window before mapping the
//! new one. Offsets are in bits relative to the start of the current
//! window, with `None` as the end-of-stream sentinel.

use std::fs::File;

use memmap2::{Mmap, MmapOptions};

use crate::bitfield;
use crate::decl::ByteOrder;
use crate::error::{CtfError, Result};

/// Probe window for reading a packet header and context before the packet
/// size is known.
pub(crate) const MAX_PACKET_HEADER_BYTES: u64 = 4096;

/// Location of one packet inside its stream file, built once at open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketIndexEntry {
    /// Byte offset of the packet in the file
    pub offset: u64,
    /// Content size in bits
    pub content_size: u64,
    /// Packet size in bits, including padding
    pub packet_size: u64,
    pub timestamp_begin: u64,
    pub timestamp_end: u64,
    /// Bit offset of the first event, just past header and context
    pub data_offset: u64,
    /// Running discarded-event counter as declared by the packet context
    pub events_discarded: u64,
}

/// Cursor into a stream file
pub struct StreamPos {
    file: File,
    file_size: u64,
    map: Option<Mmap>,
    /// Byte offset of the current window in the file
    pub(crate) mmap_offset: u64,
    /// Current packet size in bits
    pub(crate) packet_size: u64,
    /// Current content size in bits
    pub(crate) content_size: u64,
    /// Bit offset within the window; `None` once the stream is exhausted
    offset: Option<u64>,
    /// Restore point saved before each event decode
    pub(crate) last_offset: u64,
    pub(crate) cur_index: usize,
    pub(crate) packet_index: Vec<PacketIndexEntry>,
}

impl StreamPos {
    pub fn new(file: File) -> Result<Self> {
        let file_size = file.metadata()?.len();
        Ok(StreamPos {
            file,
            file_size,
            map: None,
            mmap_offset: 0,
            packet_size: 0,
            content_size: 0,
            offset: Some(0),
            last_offset: 0,
            cur_index: 0,
            packet_index: Vec::new(),
        })
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn packet_count(&self) -> usize {
        self.packet_index.len()
    }

    pub fn packet(&self, index: usize) -> Option<&PacketIndexEntry> {
        self.packet_index.get(index)
    }

    /// Map a window of `len` bytes at `byte_offset`, dropping any previous
    /// mapping first.
    pub(crate) fn map_window(&mut self, byte_offset: u64, len: u64) -> Result<()> {
        // Unmap before remapping so a single mapping is ever live.
        self.map = None;
        if len == 0 {
            self.mmap_offset = byte_offset;
            return Ok(());
        }
        // SAFETY: the mapping is private and read-only; the file stays open
        // for as long as the mapping through the owning StreamPos.
        let map = unsafe {
            MmapOptions::new()
                .offset(byte_offset)
                .len(len as usize)
                .map(&self.file)?
        };
        self.map = Some(map);
        self.mmap_offset = byte_offset;
        Ok(())
    }

    pub(crate) fn unmap(&mut self) {
        self.map = None;
    }

    #[cfg(test)]
    pub(crate) fn has_mapping(&self) -> bool {
        self.map.is_some()
    }

    fn window(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    pub(crate) fn set_offset(&mut self, offset: u64) {
        self.offset = Some(offset);
    }

    pub fn is_eof(&self) -> bool {
        self.offset.is_none()
    }

    /// Restore point saved when the last event read began
    pub fn last_offset(&self) -> u64 {
        self.last_offset
    }

    pub(crate) fn set_eof(&mut self) {
        self.offset = None;
    }

    fn current_offset(&self) -> Result<u64> {
        self.offset
            .ok_or_else(|| CtfError::decode("read past end of stream"))
    }

    /// Advance the cursor to the next multiple of `align_bits`.
    pub(crate) fn align(&mut self, align_bits: u64) -> Result<()> {
        if align_bits > 1 {
            let off = self.current_offset()?;
            self.offset = Some(off.div_ceil(align_bits) * align_bits);
        }
        Ok(())
    }

    fn check_available(&self, off: u64, len_bits: u64) -> Result<()> {
        if off + len_bits > self.content_size {
            return Err(CtfError::decode(
                "unexpected end of stream: field crosses packet content boundary",
            ));
        }
        Ok(())
    }

    /// Read an unsigned integer field and advance by exactly `len` bits.
    pub(crate) fn read_unsigned(&mut self, len: u32, order: ByteOrder) -> Result<u64> {
        let off = self.current_offset()?;
        self.check_available(off, u64::from(len))?;
        let value = bitfield::read_unsigned(self.window(), off, len, order)
            .ok_or_else(|| CtfError::decode("field crosses mapping boundary"))?;
        self.offset = Some(off + u64::from(len));
        Ok(value)
    }

    /// Read a signed integer field and advance by exactly `len` bits.
    pub(crate) fn read_signed(&mut self, len: u32, order: ByteOrder) -> Result<i64> {
        let off = self.current_offset()?;
        self.check_available(off, u64::from(len))?;
        let value = bitfield::read_signed(self.window(), off, len, order)
            .ok_or_else(|| CtfError::decode("field crosses mapping boundary"))?;
        self.offset = Some(off + u64::from(len));
        Ok(value)
    }

    /// Read a NUL-terminated byte string aligned to an 8-bit boundary.
    pub(crate) fn read_string(&mut self) -> Result<String> {
        self.align(8)?;
        let off = self.current_offset()?;
        let window = self.window();
        let start = (off / 8) as usize;
        let content_bytes = (self.content_size / 8) as usize;
        let limit = content_bytes.min(window.len());
        if start >= limit {
            return Err(CtfError::decode("string starts past packet content"));
        }
        let nul = window[start..limit]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| CtfError::decode("unterminated string in packet"))?;
        let text = String::from_utf8_lossy(&window[start..start + nul]).into_owned();
        self.offset = Some((start + nul + 1) as u64 * 8);
        Ok(text)
    }
}

impl std::fmt::Debug for StreamPos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPos")
            .field("file_size", &self.file_size)
            .field("mmap_offset", &self.mmap_offset)
            .field("packet_size", &self.packet_size)
            .field("content_size", &self.content_size)
            .field("offset", &self.offset)
            .field("cur_index", &self.cur_index)
            .field("packets", &self.packet_index.len())
            .finish()
    }
}
