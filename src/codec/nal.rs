//! NAL unit framing shared by the H.264 and H.265 parsers.
//!
//! Covers the two wire framings (Annex-B start codes and length-prefixed
//! units) plus emulation-prevention-byte handling.

use crate::{RemuxError, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Removes emulation prevention bytes: every `00 00 03` becomes `00 00`.
///
/// The `03` is a protection byte the encoder inserts so NAL payloads can
/// never contain an accidental start code.
pub fn strip_emulation_prevention(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;

    while i < data.len() {
        if i + 2 < data.len() && data[i] == 0x00 && data[i + 1] == 0x00 && data[i + 2] == 0x03 {
            out.push(0x00);
            out.push(0x00);
            i += 3;
            continue;
        }
        out.push(data[i]);
        i += 1;
    }

    out
}

/// Inserts emulation prevention bytes so the output never contains
/// `00 00 00`, `00 00 01`, `00 00 02` or `00 00 03`.
pub fn insert_emulation_prevention(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 32);
    let mut zero_run = 0usize;

    for &byte in data {
        if zero_run >= 2 && byte <= 0x03 {
            out.push(0x03);
            zero_run = 0;
        }
        out.push(byte);
        if byte == 0x00 {
            zero_run += 1;
        } else {
            zero_run = 0;
        }
    }

    out
}

/// Splits an Annex-B stream on `00 00 01` / `00 00 00 01` start codes,
/// returning the NAL units without their start codes.
pub fn split_annex_b(data: &[u8]) -> Vec<&[u8]> {
    let mut units = Vec::new();
    let mut start = None;
    let mut i = 0;

    while i + 2 < data.len() {
        if data[i] == 0x00 && data[i + 1] == 0x00 && data[i + 2] == 0x01 {
            if let Some(s) = start {
                let mut end = i;
                // A four-byte start code owns the preceding zero too
                if end > s && data[end - 1] == 0x00 {
                    end -= 1;
                }
                if end > s {
                    units.push(&data[s..end]);
                }
            }
            start = Some(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }

    if let Some(s) = start {
        if s < data.len() {
            units.push(&data[s..]);
        }
    }

    units
}

/// Reads length-prefixed NAL units with a fixed-size big-endian length word.
///
/// `length_size` must be 1, 2 or 4 (the sizes `avcC`/`hvcC` can declare).
pub fn split_length_prefixed(data: &[u8], length_size: usize) -> Result<Vec<&[u8]>> {
    if !matches!(length_size, 1 | 2 | 4) {
        return Err(RemuxError::Unsupported(format!(
            "NAL length prefix of {} bytes",
            length_size
        )));
    }

    let mut units = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        if pos + length_size > data.len() {
            return Err(RemuxError::Truncated("NAL length word".into()));
        }
        let mut len = 0usize;
        for &b in &data[pos..pos + length_size] {
            len = (len << 8) | b as usize;
        }
        pos += length_size;
        if pos + len > data.len() {
            return Err(RemuxError::Truncated("NAL unit body".into()));
        }
        units.push(&data[pos..pos + len]);
        pos += len;
    }

    Ok(units)
}

/// Writes NAL units with a fixed-size big-endian length word.
pub fn write_length_prefixed(units: &[&[u8]], length_size: usize) -> Result<Bytes> {
    if !matches!(length_size, 1 | 2 | 4) {
        return Err(RemuxError::Unsupported(format!(
            "NAL length prefix of {} bytes",
            length_size
        )));
    }

    let total: usize = units.iter().map(|u| u.len() + length_size).sum();
    let mut out = BytesMut::with_capacity(total);
    for unit in units {
        let len = unit.len();
        if length_size < 4 && len >= 1usize << (8 * length_size) {
            return Err(RemuxError::Config(format!(
                "NAL unit of {} bytes does not fit a {}-byte length word",
                len, length_size
            )));
        }
        match length_size {
            1 => out.put_u8(len as u8),
            2 => out.put_u16(len as u16),
            _ => out.put_u32(len as u32),
        }
        out.put_slice(unit);
    }

    Ok(out.freeze())
}

/// Converts an Annex-B access unit to length-prefixed framing.
pub fn annex_b_to_length_prefixed(data: &[u8], length_size: usize) -> Result<Bytes> {
    let units = split_annex_b(data);
    write_length_prefixed(&units, length_size)
}

/// Converts a length-prefixed access unit to Annex-B with 4-byte start codes.
pub fn length_prefixed_to_annex_b(data: &[u8], length_size: usize) -> Result<Bytes> {
    let units = split_length_prefixed(data, length_size)?;
    let total: usize = units.iter().map(|u| u.len() + 4).sum();
    let mut out = BytesMut::with_capacity(total);
    for unit in units {
        out.put_slice(&[0x00, 0x00, 0x00, 0x01]);
        out.put_slice(unit);
    }
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn test_strip_emulation_prevention() {
        let data = [0x00, 0x00, 0x03, 0x01, 0xAB];
        assert_eq!(strip_emulation_prevention(&data), vec![0x00, 0x00, 0x01, 0xAB]);
    }

    #[test]
    fn test_insert_guards_all_small_values() {
        for tail in 0x00..=0x03u8 {
            let escaped = insert_emulation_prevention(&[0x00, 0x00, tail]);
            assert_eq!(escaped, vec![0x00, 0x00, 0x03, tail]);
        }
        // 0x04 and above need no protection
        let clean = insert_emulation_prevention(&[0x00, 0x00, 0x04]);
        assert_eq!(clean, vec![0x00, 0x00, 0x04]);
    }

    #[test]
    fn test_split_annex_b_mixed_start_codes() {
        let data = [
            0x00, 0x00, 0x00, 0x01, 0x67, 0xAA, // 4-byte start code
            0x00, 0x00, 0x01, 0x68, 0xBB, // 3-byte start code
        ];
        let units = split_annex_b(&data);
        assert_eq!(units, vec![&[0x67, 0xAA][..], &[0x68, 0xBB][..]]);
    }

    #[test]
    fn test_length_prefixed_round_trip() {
        let units: Vec<&[u8]> = vec![&[0x67, 0x01, 0x02], &[0x68, 0x03]];
        let framed = write_length_prefixed(&units, 4).unwrap();
        let parsed = split_length_prefixed(&framed, 4).unwrap();
        assert_eq!(parsed, units);
    }

    #[test]
    fn test_length_prefixed_truncated() {
        let data = [0x00, 0x00, 0x00, 0x05, 0x01];
        assert!(split_length_prefixed(&data, 4).is_err());
    }

    #[test]
    fn test_annex_b_conversion() {
        let annexb = [0x00, 0x00, 0x01, 0x65, 0x11, 0x22];
        let prefixed = annex_b_to_length_prefixed(&annexb, 4).unwrap();
        assert_eq!(prefixed.as_ref(), &[0x00, 0x00, 0x00, 0x03, 0x65, 0x11, 0x22]);
        let back = length_prefixed_to_annex_b(&prefixed, 4).unwrap();
        assert_eq!(back.as_ref(), &[0x00, 0x00, 0x00, 0x01, 0x65, 0x11, 0x22]);
    }

    #[quickcheck]
    fn prop_emulation_round_trip(data: Vec<u8>) -> bool {
        strip_emulation_prevention(&insert_emulation_prevention(&data)) == data
    }

    #[quickcheck]
    fn prop_insert_never_leaves_forbidden_sequence(data: Vec<u8>) -> bool {
        let escaped = insert_emulation_prevention(&data);
        !escaped
            .windows(3)
            .any(|w| w[0] == 0x00 && w[1] == 0x00 && w[2] <= 0x02)
    }
}
