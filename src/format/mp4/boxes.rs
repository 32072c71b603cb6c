use crate::io::{Source, SourceExt};
use crate::{RemuxError, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// The closed set of box types whose body is a sequence of child boxes.
///
/// `meta` is also a container but carries a full-box header before its
/// children; see [`is_full_container`].
pub const CONTAINER_TYPES: [&[u8; 4]; 16] = [
    b"moov", b"trak", b"mdia", b"minf", b"stbl", b"dinf", b"edts", b"udta", b"meta", b"ilst",
    b"moof", b"traf", b"mvex", b"sinf", b"schi", b"rinf",
];

/// Whether `box_type` contains child boxes
pub fn is_container(box_type: &[u8; 4]) -> bool {
    CONTAINER_TYPES.iter().any(|t| *t == box_type)
}

/// Whether `box_type` is a container with a version/flags word before its
/// children
pub fn is_full_container(box_type: &[u8; 4]) -> bool {
    box_type == b"meta"
}

/// A parsed box header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    /// Four-character box type
    pub box_type: [u8; 4],
    /// File offset of the size field
    pub start: u64,
    /// Total box size including the header
    pub size: u64,
    /// Bytes consumed by the size/type (and largesize) fields
    pub header_len: u64,
}

impl BoxHeader {
    /// File offset of the first body byte
    pub fn body_start(&self) -> u64 {
        self.start + self.header_len
    }

    /// Body length in bytes
    pub fn body_size(&self) -> u64 {
        self.size.saturating_sub(self.header_len)
    }

    /// File offset just past the box
    pub fn end(&self) -> u64 {
        self.start + self.size
    }
}

/// Reads one box header at the source's current position.
///
/// Handles the 64-bit `largesize` extension and the size-0 "extends to end
/// of file" form. Returns `None` cleanly at end-of-stream.
pub async fn read_box_header(source: &mut (dyn Source + '_)) -> Result<Option<BoxHeader>> {
    let start = source.position();
    let size32 = match source.read_u32().await? {
        Some(v) => v,
        None => return Ok(None),
    };
    let box_type = match source.read_fourcc().await? {
        Some(t) => t,
        None => return Ok(None),
    };

    let (size, header_len) = match size32 {
        0 => {
            let total = source
                .size()
                .ok_or_else(|| RemuxError::Unsupported("size-0 box on unsized source".into()))?;
            (total - start, 8)
        }
        1 => {
            let largesize = source
                .read_u64()
                .await?
                .ok_or_else(|| RemuxError::Truncated("box largesize".into()))?;
            (largesize, 16)
        }
        n => (n as u64, 8),
    };

    if size < header_len {
        return Err(RemuxError::Malformed(format!(
            "box '{}' with size {} smaller than its header",
            fourcc_str(&box_type),
            size
        )));
    }

    Ok(Some(BoxHeader {
        box_type,
        start,
        size,
        header_len,
    }))
}

/// Renders a FourCC for diagnostics, escaping non-ASCII bytes
pub fn fourcc_str(tag: &[u8; 4]) -> String {
    tag.iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                (b as char).to_string()
            } else {
                format!("\\x{:02x}", b)
            }
        })
        .collect()
}

/// Wraps `body` in a box of the given type
pub fn write_box(box_type: &[u8; 4], body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + body.len());
    let total = body.len() as u64 + 8;
    if total > u32::MAX as u64 {
        let mut buf = BytesMut::with_capacity(16 + body.len());
        buf.put_u32(1);
        buf.put_slice(box_type);
        buf.put_u64(body.len() as u64 + 16);
        buf.put_slice(body);
        return buf.freeze();
    }
    buf.put_u32(total as u32);
    buf.put_slice(box_type);
    buf.put_slice(body);
    buf.freeze()
}

/// Wraps `body` in a full box (version + 24-bit flags)
pub fn write_full_box(box_type: &[u8; 4], version: u8, flags: u32, body: &[u8]) -> Bytes {
    let mut full = BytesMut::with_capacity(4 + body.len());
    full.put_u8(version);
    full.put_slice(&[(flags >> 16) as u8, (flags >> 8) as u8, flags as u8]);
    full.put_slice(body);
    write_box(box_type, &full)
}

/// The version + flags word leading a full box body
pub fn fullbox_header(version: u8, flags: u32) -> [u8; 4] {
    [version, (flags >> 16) as u8, (flags >> 8) as u8, flags as u8]
}

/// Converts to 16.16 fixed point
pub fn to_fixed_16_16(value: f64) -> u32 {
    (value * 65536.0).round() as i64 as u32
}

/// Converts from 16.16 fixed point
pub fn from_fixed_16_16(value: u32) -> f64 {
    value as i32 as f64 / 65536.0
}

/// Packs a three-letter ISO-639 language code into the 15-bit mdhd form.
///
/// Unknown or absent codes pack as `und`.
pub fn pack_language(language: Option<&str>) -> u16 {
    let code = language.unwrap_or("und").as_bytes();
    if code.len() != 3 || code.iter().any(|&c| !(0x61..=0x7A).contains(&c)) {
        return pack_language(Some("und"));
    }
    (((code[0] - 0x60) as u16) << 10) | (((code[1] - 0x60) as u16) << 5) | (code[2] - 0x60) as u16
}

/// Unpacks an mdhd 15-bit language code; `None` for `und` or invalid values
pub fn unpack_language(packed: u16) -> Option<String> {
    let letters = [
        ((packed >> 10) & 0x1F) as u8 + 0x60,
        ((packed >> 5) & 0x1F) as u8 + 0x60,
        (packed & 0x1F) as u8 + 0x60,
    ];
    if letters.iter().any(|&c| !(0x61..=0x7A).contains(&c)) {
        return None;
    }
    let code = String::from_utf8_lossy(&letters).into_owned();
    if code == "und" {
        None
    } else {
        Some(code)
    }
}

/// Iterates child boxes inside an in-memory box body.
///
/// Yields `(box_type, body)` pairs; handles the 64-bit largesize form.
/// Malformed trailing bytes end the iteration rather than erroring, which
/// is the recovery rule for best-effort walks like `udta`.
pub fn children(data: &[u8]) -> ChildIter<'_> {
    ChildIter { data, pos: 0 }
}

/// Iterator over the child boxes of an in-memory body
pub struct ChildIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for ChildIter<'a> {
    type Item = ([u8; 4], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.data[self.pos.min(self.data.len())..];
        if rest.len() < 8 {
            return None;
        }
        let size32 = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
        let box_type = [rest[4], rest[5], rest[6], rest[7]];
        let (size, header_len) = match size32 {
            0 => (rest.len() as u64, 8usize),
            1 => {
                if rest.len() < 16 {
                    return None;
                }
                (
                    u64::from_be_bytes([
                        rest[8], rest[9], rest[10], rest[11], rest[12], rest[13], rest[14],
                        rest[15],
                    ]),
                    16,
                )
            }
            n => (n as u64, 8),
        };
        if size < header_len as u64 || size > rest.len() as u64 {
            return None;
        }
        let body = &rest[header_len..size as usize];
        self.pos += size as usize;
        Some((box_type, body))
    }
}

/// Finds the first child with the given type inside an in-memory body,
/// descending through the full-box header of `meta` automatically.
pub fn find_child<'a>(data: &'a [u8], box_type: &[u8; 4]) -> Option<&'a [u8]> {
    children(data)
        .find(|(t, _)| t == box_type)
        .map(|(t, body)| {
            if is_full_container(&t) && body.len() >= 4 {
                &body[4..]
            } else {
                body
            }
        })
}

/// Walks a `/`-separated path of child types, e.g. `mdia` → `minf` → `stbl`
pub fn find_path<'a>(data: &'a [u8], path: &[&[u8; 4]]) -> Option<&'a [u8]> {
    let mut current = data;
    for box_type in path {
        current = find_child(current, box_type)?;
    }
    Some(current)
}

/// Seconds between 1904-01-01 (the QuickTime epoch) and 1970-01-01
pub const MP4_EPOCH_OFFSET: u64 = 2_082_844_800;

/// Current time in seconds since the QuickTime epoch
pub fn mp4_timestamp_now() -> u64 {
    let unix = chrono::Utc::now().timestamp().max(0) as u64;
    unix + MP4_EPOCH_OFFSET
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::BufSource;

    #[tokio::test]
    async fn test_read_box_header_plain() {
        let data = write_box(b"free", &[0u8; 4]);
        let mut src = BufSource::new(data);
        let header = read_box_header(&mut src).await.unwrap().unwrap();
        assert_eq!(&header.box_type, b"free");
        assert_eq!(header.size, 12);
        assert_eq!(header.body_size(), 4);
        assert_eq!(header.end(), 12);
    }

    #[tokio::test]
    async fn test_read_box_header_largesize() {
        let mut data = Vec::new();
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(b"mdat");
        data.extend_from_slice(&24u64.to_be_bytes());
        data.extend_from_slice(&[0u8; 8]);
        let mut src = BufSource::new(data);
        let header = read_box_header(&mut src).await.unwrap().unwrap();
        assert_eq!(&header.box_type, b"mdat");
        assert_eq!(header.size, 24);
        assert_eq!(header.header_len, 16);
        assert_eq!(header.body_size(), 8);
    }

    #[tokio::test]
    async fn test_read_box_header_to_eof() {
        let mut data = Vec::new();
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(b"mdat");
        data.extend_from_slice(&[0u8; 100]);
        let mut src = BufSource::new(data);
        let header = read_box_header(&mut src).await.unwrap().unwrap();
        assert_eq!(header.size, 108);
    }

    #[tokio::test]
    async fn test_read_box_header_eof_sentinel() {
        let mut src = BufSource::new(Vec::<u8>::new());
        assert!(read_box_header(&mut src).await.unwrap().is_none());
    }

    #[test]
    fn test_container_membership() {
        assert!(is_container(b"moov"));
        assert!(is_container(b"ilst"));
        assert!(!is_container(b"mdat"));
        assert!(is_full_container(b"meta"));
        assert!(!is_full_container(b"moov"));
    }

    #[test]
    fn test_language_packing() {
        let packed = pack_language(Some("eng"));
        assert_eq!(unpack_language(packed).as_deref(), Some("eng"));
        // und round-trips to None
        assert_eq!(unpack_language(pack_language(None)), None);
        // invalid input packs as und
        assert_eq!(unpack_language(pack_language(Some("e!"))), None);
    }

    #[test]
    fn test_child_iteration() {
        let inner = write_box(b"stbl", b"xyz");
        let minf = write_box(b"minf", &inner);
        let mdia = write_box(b"mdia", &minf);
        let found = find_path(&mdia, &[b"mdia", b"minf", b"stbl"]).unwrap();
        assert_eq!(found, b"xyz");
        assert_eq!(find_path(&mdia, &[b"mdia", b"stbl"]), None);
    }

    #[test]
    fn test_meta_fullbox_descend() {
        let ilst = write_box(b"ilst", &[]);
        let mut meta_body = Vec::from(fullbox_header(0, 0));
        meta_body.extend_from_slice(&ilst);
        let meta = write_box(b"meta", &meta_body);
        let inside = find_child(&meta, b"meta").unwrap();
        assert!(find_child(inside, b"ilst").is_some());
    }

    #[test]
    fn test_fixed_point() {
        assert_eq!(to_fixed_16_16(1.0), 0x0001_0000);
        assert_eq!(from_fixed_16_16(0xFFFF_0000), -1.0);
        assert_eq!(from_fixed_16_16(to_fixed_16_16(640.0)), 640.0);
    }
}
