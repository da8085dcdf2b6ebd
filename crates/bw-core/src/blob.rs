//! BWE Engine Blob Format v1
//!
//! Persisted engines and downloaded snapshots share one framed layout.
//! All values are little-endian.
//!
//! ```text
//! +0   u8[4] magic = "BWE1"
//! +4   u16   version
//! +6   u16   flags
//! +8   u32   metaBytes   (JSON engine metadata)
//! +12  u32   bodyBytes   (serialized ruleset)
//! +16  u32   crc32       (over meta + body)
//! +20  meta
//! +20+metaBytes body
//! ```

/// Magic bytes: "BWE1"
pub const BLOB_MAGIC: [u8; 4] = [0x42, 0x57, 0x45, 0x31];

/// Current format version
pub const BLOB_VERSION: u16 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 20;

/// Header field byte offsets.
pub mod header {
    pub const MAGIC: usize = 0;
    pub const VERSION: usize = 4;
    pub const FLAGS: usize = 6;
    pub const META_BYTES: usize = 8;
    pub const BODY_BYTES: usize = 12;
    pub const CRC32: usize = 16;
}

/// Header flags.
pub mod header_flags {
    /// Blob includes a CRC32 checksum
    pub const HAS_CRC32: u16 = 1 << 0;
}

/// Error type for blob decoding.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("Invalid magic bytes")]
    InvalidMagic,
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),
    #[error("CRC32 mismatch: stored={stored}, computed={computed}")]
    Crc32Mismatch { stored: u32, computed: u32 },
    #[error("Data too short")]
    DataTooShort,
    #[error("Invalid engine metadata: {0}")]
    Meta(#[from] serde_json::Error),
    #[error("Invalid engine body: {0}")]
    Body(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Frame `meta` and `body` into a blob.
pub fn encode(meta: &[u8], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + meta.len() + body.len());
    out.extend_from_slice(&BLOB_MAGIC);
    out.extend_from_slice(&BLOB_VERSION.to_le_bytes());
    out.extend_from_slice(&header_flags::HAS_CRC32.to_le_bytes());
    out.extend_from_slice(&(meta.len() as u32).to_le_bytes());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());

    let mut crc = Crc32::new();
    crc.update(meta);
    crc.update(body);
    out.extend_from_slice(&crc.finish().to_le_bytes());

    out.extend_from_slice(meta);
    out.extend_from_slice(body);
    out
}

/// Split a blob into its `(meta, body)` sections, validating the header.
pub fn decode(data: &[u8]) -> Result<(&[u8], &[u8]), BlobError> {
    if data.len() < HEADER_SIZE {
        return Err(BlobError::DataTooShort);
    }

    if data[header::MAGIC..header::MAGIC + 4] != BLOB_MAGIC {
        return Err(BlobError::InvalidMagic);
    }

    let version = read_u16_le(data, header::VERSION);
    if version != BLOB_VERSION {
        return Err(BlobError::UnsupportedVersion(version));
    }

    let flags = read_u16_le(data, header::FLAGS);
    let meta_len = read_u32_le(data, header::META_BYTES) as usize;
    let body_len = read_u32_le(data, header::BODY_BYTES) as usize;

    let meta_end = HEADER_SIZE + meta_len;
    let body_end = meta_end + body_len;
    if body_end > data.len() {
        return Err(BlobError::DataTooShort);
    }

    let meta = &data[HEADER_SIZE..meta_end];
    let body = &data[meta_end..body_end];

    if flags & header_flags::HAS_CRC32 != 0 {
        let stored = read_u32_le(data, header::CRC32);
        let mut crc = Crc32::new();
        crc.update(meta);
        crc.update(body);
        let computed = crc.finish();
        if stored != computed {
            return Err(BlobError::Crc32Mismatch { stored, computed });
        }
    }

    Ok((meta, body))
}

/// Read u16 little-endian.
#[inline]
fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

/// Read u32 little-endian.
#[inline]
fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

// =============================================================================
// CRC32 (IEEE 802.3)
// =============================================================================

static CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = i as u32;
        let mut j = 0;
        while j < 8 {
            c = if c & 1 != 0 { 0xedb88320 ^ (c >> 1) } else { c >> 1 };
            j += 1;
        }
        table[i] = c;
        i += 1;
    }
    table
};

/// Streaming CRC32 so sections can be checksummed without concatenating them.
struct Crc32(u32);

impl Crc32 {
    fn new() -> Self {
        Self(0xffffffff)
    }

    fn update(&mut self, data: &[u8]) {
        for &byte in data {
            self.0 = CRC32_TABLE[((self.0 ^ byte as u32) & 0xff) as usize] ^ (self.0 >> 8);
        }
    }

    fn finish(&self) -> u32 {
        self.0 ^ 0xffffffff
    }
}

/// CRC32 of `data`.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = Crc32::new();
    crc.update(data);
    crc.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_known_value() {
        assert_eq!(crc32(b"123456789"), 0xcbf43926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn test_encode_decode() {
        let blob = encode(b"{\"name\":\"main\"}", b"body");
        let (meta, body) = decode(&blob).unwrap();
        assert_eq!(meta, b"{\"name\":\"main\"}");
        assert_eq!(body, b"body");
    }

    #[test]
    fn test_decode_rejects_corruption() {
        let mut blob = encode(b"{}", b"rules");
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        assert!(matches!(decode(&blob), Err(BlobError::Crc32Mismatch { .. })));

        assert!(matches!(decode(b"BWE"), Err(BlobError::DataTooShort)));

        let mut wrong_magic = encode(b"{}", b"");
        wrong_magic[0] = b'X';
        assert!(matches!(decode(&wrong_magic), Err(BlobError::InvalidMagic)));

        let mut wrong_version = encode(b"{}", b"");
        wrong_version[header::VERSION] = 9;
        assert!(matches!(decode(&wrong_version), Err(BlobError::UnsupportedVersion(9))));
    }

    #[test]
    fn test_decode_rejects_truncated_body() {
        let blob = encode(b"{}", b"rules");
        assert!(matches!(decode(&blob[..blob.len() - 2]), Err(BlobError::DataTooShort)));
    }
}
