//! Binary assembly data
//!
//! Structure embedded in attached models and streamed segments. Layout:
//!
//! ```text
//! offset  size  field
//! 0       4     magic "ASMB"
//! 4       4     version (little endian)
//! 8       4     flags
//! 12      4     id span
//! 16      4     body length
//! 20      n     bincode-encoded ParsedAssembly
//! ```
//!
//! Segments of a streamed model carry [`AssemblyDataHeader::FLAG_SEGMENT`];
//! their records may hang under parents from earlier segments, so they skip
//! the document-order check.

use cadstream_core::error::ParseError;
use cadstream_tree::ParsedAssembly;

/// Magic bytes opening every assembly data blob
pub const MAGIC: [u8; 4] = *b"ASMB";

/// Oldest readable format version
pub const MIN_SUPPORTED_VERSION: u32 = 1;

/// Newest readable format version
pub const MAX_SUPPORTED_VERSION: u32 = 1;

/// Size of the fixed header
pub const HEADER_LEN: usize = 20;

/// Fixed header in front of the encoded records
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AssemblyDataHeader {
    pub version: u32,
    pub flags: u32,
    pub id_span: u32,
    pub body_len: u32,
}

impl AssemblyDataHeader {
    /// Blob is one segment of a streamed model
    pub const FLAG_SEGMENT: u32 = 1 << 0;

    /// Read and check the header
    pub fn read(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < HEADER_LEN {
            return Err(ParseError::Truncated {
                expected: HEADER_LEN,
                found: bytes.len(),
            });
        }
        if bytes[0..4] != MAGIC {
            return Err(ParseError::BadMagic);
        }

        let header = Self {
            version: read_u32(bytes, 4),
            flags: read_u32(bytes, 8),
            id_span: read_u32(bytes, 12),
            body_len: read_u32(bytes, 16),
        };
        if !(MIN_SUPPORTED_VERSION..=MAX_SUPPORTED_VERSION).contains(&header.version) {
            return Err(ParseError::UnsupportedVersion {
                found: header.version,
                min: MIN_SUPPORTED_VERSION,
                max: MAX_SUPPORTED_VERSION,
            });
        }
        Ok(header)
    }

    /// Append the header to a buffer
    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.id_span.to_le_bytes());
        out.extend_from_slice(&self.body_len.to_le_bytes());
    }

    /// Check if the blob is a stream segment
    pub fn is_segment(&self) -> bool {
        self.flags & Self::FLAG_SEGMENT != 0
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(word)
}

/// Decode a complete blob
pub fn decode_assembly_data(bytes: &[u8]) -> Result<ParsedAssembly, ParseError> {
    let header = AssemblyDataHeader::read(bytes)?;
    let end = HEADER_LEN + header.body_len as usize;
    if bytes.len() < end {
        return Err(ParseError::Truncated {
            expected: end,
            found: bytes.len(),
        });
    }

    let mut parsed: ParsedAssembly = bincode::deserialize(&bytes[HEADER_LEN..end])
        .map_err(|e| ParseError::Decode(e.to_string()))?;
    parsed.id_span = parsed.id_span.max(header.id_span);

    if !header.is_segment() {
        parsed.validate()?;
    }
    log::trace!(
        "AssemblyData: decoded {} record(s), span {}",
        parsed.nodes.len(),
        parsed.id_span
    );
    Ok(parsed)
}

/// Encode a complete document
pub fn encode_assembly_data(parsed: &ParsedAssembly) -> Result<Vec<u8>, ParseError> {
    encode(parsed, 0)
}

/// Encode one segment of a streamed model
pub fn encode_segment(parsed: &ParsedAssembly) -> Result<Vec<u8>, ParseError> {
    encode(parsed, AssemblyDataHeader::FLAG_SEGMENT)
}

fn encode(parsed: &ParsedAssembly, flags: u32) -> Result<Vec<u8>, ParseError> {
    let body = bincode::serialize(parsed).map_err(|e| ParseError::Decode(e.to_string()))?;
    let body_len = u32::try_from(body.len())
        .map_err(|_| ParseError::Decode(format!("body of {} bytes too large", body.len())))?;

    let header = AssemblyDataHeader {
        version: MAX_SUPPORTED_VERSION,
        flags,
        id_span: parsed.id_span.max(parsed.required_span()),
        body_len,
    };
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    header.write(&mut out);
    out.extend_from_slice(&body);
    Ok(out)
}
