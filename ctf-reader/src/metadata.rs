//! Metadata framing reader
//!
//! A `metadata` file is either plain TSDL text or a sequence of binary
//! metadata packets whose payloads concatenate to the same text. The
//! packet framing is detected from its leading magic number, which also
//! fixes the trace byte order; text metadata adopts the host byte order.

use std::io::{Read, Seek, SeekFrom};

use uuid::Uuid;

use crate::decl::ByteOrder;
use crate::error::{CtfError, Result};

/// Magic number opening every binary metadata packet
pub const TSDL_MAGIC: u32 = 0x75D1_1D57;

/// Packed size of the metadata packet header
pub(crate) const METADATA_PACKET_HEADER_BYTES: usize = 37;

/// Metadata text plus the trace-wide facts the framing revealed
#[derive(Debug)]
pub struct MetadataText {
    pub text: String,
    /// Trace byte order: from the framing magic in packet mode, host
    /// order in text mode.
    pub byte_order: ByteOrder,
    /// UUID carried by the packet framing, if any
    pub uuid: Option<Uuid>,
    /// True when the metadata was packet-framed; the byte order is then
    /// authoritative and immutable.
    pub packet_framed: bool,
}

/// Binary metadata packet header, little- or big-endian per the magic
#[derive(Debug, Clone, Copy)]
struct MetadataPacketHeader {
    magic: u32,
    uuid: [u8; 16],
    checksum: u32,
    /// Content size in bits, header included
    content_size: u32,
    /// Packet size in bits, padding included
    packet_size: u32,
    compression_scheme: u8,
    encryption_scheme: u8,
    checksum_scheme: u8,
    major: u8,
    minor: u8,
}

impl MetadataPacketHeader {
    fn from_bytes(raw: &[u8; METADATA_PACKET_HEADER_BYTES], swap: bool) -> Self {
        let u32_at = |off: usize| {
            let bytes = [raw[off], raw[off + 1], raw[off + 2], raw[off + 3]];
            let v = u32::from_ne_bytes(bytes);
            if swap {
                v.swap_bytes()
            } else {
                v
            }
        };
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&raw[4..20]);
        MetadataPacketHeader {
            magic: u32_at(0),
            uuid,
            checksum: u32_at(20),
            content_size: u32_at(24),
            packet_size: u32_at(28),
            compression_scheme: raw[32],
            encryption_scheme: raw[33],
            checksum_scheme: raw[34],
            major: raw[35],
            minor: raw[36],
        }
    }
}

/// Warn on anything but CTF 1.8; version mismatch never fails the open.
pub(crate) fn check_version(major: u32, minor: u32) {
    if (major, minor) != (1, 8) {
        eprintln!(
            "[warning] Unsupported CTF specification version {major}.{minor}. Trying anyway."
        );
    }
}

/// Detect the framing and return the concatenated metadata text.
pub fn read_metadata<R: Read + Seek>(mut input: R) -> Result<MetadataText> {
    let mut magic_bytes = [0u8; 4];
    let sniffed = read_full(&mut input, &mut magic_bytes)?;
    input.seek(SeekFrom::Start(0))?;

    if sniffed == 4 {
        let magic = u32::from_ne_bytes(magic_bytes);
        if magic == TSDL_MAGIC {
            return read_packet_metadata(input, ByteOrder::native());
        }
        if magic == TSDL_MAGIC.swap_bytes() {
            return read_packet_metadata(input, ByteOrder::native().swapped());
        }
    }
    read_text_metadata(input)
}

fn read_packet_metadata<R: Read + Seek>(mut input: R, order: ByteOrder) -> Result<MetadataText> {
    let swap = order != ByteOrder::native();
    let mut text = Vec::new();
    let mut trace_uuid: Option<[u8; 16]> = None;

    loop {
        let mut raw = [0u8; METADATA_PACKET_HEADER_BYTES];
        match read_full(&mut input, &mut raw)? {
            0 => break,
            n if n == METADATA_PACKET_HEADER_BYTES => {}
            n => {
                return Err(CtfError::metadata(format!(
                    "truncated metadata packet header: {n} bytes"
                )))
            }
        }
        let header = MetadataPacketHeader::from_bytes(&raw, swap);
        tracing::debug!(
            content_size = header.content_size,
            packet_size = header.packet_size,
            "metadata packet"
        );

        if header.magic != TSDL_MAGIC {
            return Err(CtfError::metadata(format!(
                "invalid metadata packet magic {:#x}",
                header.magic
            )));
        }
        if header.checksum != 0 {
            eprintln!("[warning] checksum verification not supported yet.");
        }
        if header.compression_scheme != 0 {
            return Err(CtfError::UnsupportedFraming {
                scheme: "compression",
                value: header.compression_scheme,
            });
        }
        if header.encryption_scheme != 0 {
            return Err(CtfError::UnsupportedFraming {
                scheme: "encryption",
                value: header.encryption_scheme,
            });
        }
        if header.checksum_scheme != 0 {
            return Err(CtfError::UnsupportedFraming {
                scheme: "checksum",
                value: header.checksum_scheme,
            });
        }
        check_version(u32::from(header.major), u32::from(header.minor));

        match trace_uuid {
            None => trace_uuid = Some(header.uuid),
            Some(uuid) if uuid != header.uuid => return Err(CtfError::UuidMismatch),
            Some(_) => {}
        }

        let content_bytes = u64::from(header.content_size) / 8;
        if (content_bytes as usize) < METADATA_PACKET_HEADER_BYTES {
            return Err(CtfError::metadata(format!(
                "metadata packet content ({content_bytes} bytes) smaller than its header"
            )));
        }
        if header.packet_size < header.content_size {
            return Err(CtfError::metadata(format!(
                "metadata packet size ({} bits) smaller than content size ({} bits)",
                header.packet_size, header.content_size
            )));
        }

        let payload_len = content_bytes as usize - METADATA_PACKET_HEADER_BYTES;
        let start = text.len();
        text.resize(start + payload_len, 0);
        input.read_exact(&mut text[start..])?;

        let padding = (u64::from(header.packet_size) - u64::from(header.content_size)) / 8;
        input.seek(SeekFrom::Current(padding as i64))?;
    }

    Ok(MetadataText {
        text: String::from_utf8_lossy(&text).into_owned(),
        byte_order: order,
        uuid: trace_uuid.map(Uuid::from_bytes),
        packet_framed: true,
    })
}

fn read_text_metadata<R: Read>(mut input: R) -> Result<MetadataText> {
    let mut raw = Vec::new();
    input.read_to_end(&mut raw)?;
    let text = String::from_utf8_lossy(&raw).into_owned();

    match sniff_text_version(&text) {
        Some((major, minor)) => check_version(major, minor),
        None => eprintln!(
            "[warning] Ill-shapen or missing \"/* CTF x.y\" header for text-only metadata."
        ),
    }

    Ok(MetadataText {
        text,
        byte_order: ByteOrder::native(),
        uuid: None,
        packet_framed: false,
    })
}

/// Parse the leading `/* CTF x.y` comment of text metadata.
fn sniff_text_version(text: &str) -> Option<(u32, u32)> {
    let rest = text.strip_prefix("/*")?.trim_start();
    let rest = rest.strip_prefix("CTF")?.trim_start();
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    let (major, minor) = rest[..end].split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// Read until the buffer is full or the input is exhausted.
fn read_full<R: Read>(input: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = input.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
