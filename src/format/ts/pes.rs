use super::types::seconds_to_pts;
use crate::{RemuxError, Result};
use bytes::{BufMut, BytesMut};

/// A Packetized Elementary Stream header.
#[derive(Debug, Clone)]
pub struct PesHeader {
    /// Always 0x000001
    pub start_code_prefix: u32,
    /// Stream id (0xE0 video, 0xC0 audio)
    pub stream_id: u8,
    /// PES_packet_length; 0 for unbounded video
    pub packet_length: u16,
    /// PTS in 90 kHz units
    pub pts: Option<u64>,
    /// DTS in 90 kHz units
    pub dts: Option<u64>,
}

impl PesHeader {
    /// Creates a header for `stream_id` with no timestamps
    pub fn new(stream_id: u8) -> Self {
        Self {
            start_code_prefix: 0x000001,
            stream_id,
            packet_length: 0,
            pts: None,
            dts: None,
        }
    }

    /// Sets the PTS from seconds
    pub fn with_pts(mut self, seconds: f64) -> Self {
        self.pts = Some(seconds_to_pts(seconds));
        self
    }

    /// Sets the DTS from seconds
    pub fn with_dts(mut self, seconds: f64) -> Self {
        self.dts = Some(seconds_to_pts(seconds));
        self
    }

    /// Size of the serialized header in bytes
    pub fn serialized_len(&self) -> usize {
        9 + if self.pts.is_some() { 5 } else { 0 } + if self.dts.is_some() { 5 } else { 0 }
    }

    /// Serializes the header
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8((self.start_code_prefix >> 16) as u8);
        buf.put_u8((self.start_code_prefix >> 8) as u8);
        buf.put_u8(self.start_code_prefix as u8);
        buf.put_u8(self.stream_id);
        buf.put_u16(self.packet_length);

        // '10' marker + flags
        buf.put_u8(0x80);
        let pts_dts_flags: u8 = match (self.pts.is_some(), self.dts.is_some()) {
            (true, true) => 0xC0,
            (true, false) => 0x80,
            _ => 0x00,
        };
        buf.put_u8(pts_dts_flags);
        let header_data_length =
            (if self.pts.is_some() { 5 } else { 0 }) + (if self.dts.is_some() { 5 } else { 0 });
        buf.put_u8(header_data_length);

        if let Some(pts) = self.pts {
            let marker = if self.dts.is_some() { 0x30 } else { 0x20 };
            write_timestamp(buf, marker, pts);
        }
        if let Some(dts) = self.dts {
            write_timestamp(buf, 0x10, dts);
        }
    }
}

/// A PES packet: header plus elementary-stream payload.
#[derive(Debug)]
pub struct PesPacket {
    /// The packet header
    pub header: PesHeader,
    /// Elementary stream bytes
    pub payload: Vec<u8>,
}

impl PesPacket {
    /// Creates a packet for `stream_id` wrapping `payload`
    pub fn new(stream_id: u8, payload: Vec<u8>) -> Self {
        Self {
            header: PesHeader::new(stream_id),
            payload,
        }
    }

    /// Sets the PTS from seconds
    pub fn with_pts(mut self, seconds: f64) -> Self {
        self.header = self.header.with_pts(seconds);
        self
    }

    /// Sets the DTS from seconds
    pub fn with_dts(mut self, seconds: f64) -> Self {
        self.header = self.header.with_dts(seconds);
        self
    }

    /// Serializes header and payload, setting PES_packet_length when it
    /// fits the 16-bit field
    pub fn write_to(&self, buf: &mut BytesMut) {
        let mut header = self.header.clone();
        let tail = header.serialized_len() - 6 + self.payload.len();
        header.packet_length = u16::try_from(tail).unwrap_or(0);
        header.write_to(buf);
        buf.extend_from_slice(&self.payload);
    }

    /// Total serialized size in bytes
    pub fn len(&self) -> usize {
        self.header.serialized_len() + self.payload.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// The five-byte `0010 pts[32:30] 1 pts[29:15] 1 pts[14:0] 1` pattern
fn write_timestamp(buf: &mut BytesMut, marker: u8, ts: u64) {
    let ts = ts & 0x1_FFFF_FFFF;
    buf.put_u8(marker | ((ts >> 29) & 0x0E) as u8 | 0x01);
    buf.put_u16((((ts >> 14) & 0xFFFE) | 0x01) as u16);
    buf.put_u16((((ts << 1) & 0xFFFE) | 0x01) as u16);
}

/// A parsed PES header with the payload boundary located.
#[derive(Debug, Clone, Copy)]
pub struct ParsedPes {
    /// PTS in 90 kHz units, when signalled
    pub pts: Option<u64>,
    /// DTS in 90 kHz units, when signalled
    pub dts: Option<u64>,
    /// Offset of the elementary-stream payload
    pub payload_start: usize,
}

/// Parses an assembled PES buffer (starting at the 00 00 01 prefix).
pub fn parse_pes(data: &[u8]) -> Result<ParsedPes> {
    if data.len() < 9 {
        return Err(RemuxError::Truncated("PES header".into()));
    }
    if data[0] != 0x00 || data[1] != 0x00 || data[2] != 0x01 {
        return Err(RemuxError::Malformed("bad PES start code".into()));
    }

    let pts_dts_flags = data[7] >> 6;
    let header_data_length = data[8] as usize;
    let payload_start = 9 + header_data_length;
    if data.len() < payload_start {
        return Err(RemuxError::Truncated("PES optional header".into()));
    }

    let mut pts = None;
    let mut dts = None;
    if pts_dts_flags >= 2 {
        if data.len() < 14 {
            return Err(RemuxError::Truncated("PES PTS".into()));
        }
        pts = Some(read_timestamp(&data[9..14]));
        if pts_dts_flags == 3 {
            if data.len() < 19 {
                return Err(RemuxError::Truncated("PES DTS".into()));
            }
            dts = Some(read_timestamp(&data[14..19]));
        }
    }

    Ok(ParsedPes {
        pts,
        dts,
        payload_start,
    })
}

fn read_timestamp(data: &[u8]) -> u64 {
    (((data[0] as u64) & 0x0E) << 29)
        | ((data[1] as u64) << 22)
        | (((data[2] as u64) & 0xFE) << 14)
        | ((data[3] as u64) << 7)
        | (((data[4] as u64) & 0xFE) >> 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::types::pts_to_seconds;

    #[test]
    fn test_pes_header_write() {
        let mut buf = BytesMut::new();
        let packet = PesPacket::new(0xE0, vec![0u8; 10]).with_pts(1.0);
        packet.write_to(&mut buf);
        assert_eq!(&buf[0..3], &[0x00, 0x00, 0x01]);
        assert_eq!(buf[3], 0xE0);
        // header_data_length = 5 (PTS only)
        assert_eq!(buf[8], 5);
    }

    #[test]
    fn test_timestamp_round_trip() {
        for &seconds in &[0.0, 0.5, 1.0, 95443.0] {
            let mut buf = BytesMut::new();
            let packet = PesPacket::new(0xE0, vec![1, 2, 3])
                .with_pts(seconds + 0.04)
                .with_dts(seconds);
            packet.write_to(&mut buf);
            let parsed = parse_pes(&buf).unwrap();
            assert!((pts_to_seconds(parsed.pts.unwrap()) - (seconds + 0.04)).abs() < 1e-4);
            assert!((pts_to_seconds(parsed.dts.unwrap()) - seconds).abs() < 1e-4);
            assert_eq!(&buf[parsed.payload_start..], &[1, 2, 3]);
        }
    }

    #[test]
    fn test_parse_rejects_bad_start_code() {
        let data = [0x00, 0x00, 0x02, 0xE0, 0, 0, 0x80, 0, 0];
        assert!(parse_pes(&data).is_err());
    }
}
