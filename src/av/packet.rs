use bytes::Bytes;

/// A single encoded access unit together with its timing.
///
/// Packets are self-contained values: they hold no reference back to the
/// demuxer that produced them. Timestamps are in seconds.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Opaque payload bytes (one video frame or audio frame of compressed data)
    pub data: Bytes,
    /// Id of the owning track within its container
    pub track_id: u32,
    /// Decode timestamp in seconds
    pub time: f64,
    /// Duration in seconds, when the container provides one
    pub duration: Option<f64>,
    /// Whether this access unit is a sync sample
    pub is_key: bool,
    /// Composition-time offset (PTS minus DTS) in seconds
    pub composition_offset: Option<f64>,
    /// Explicit presentation timestamp in seconds, when distinct from `time`
    pub pts: Option<f64>,
}

impl Packet {
    /// Creates a packet with zeroed timing on track 0
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            track_id: 0,
            time: 0.0,
            duration: None,
            is_key: false,
            composition_offset: None,
            pts: None,
        }
    }

    /// Sets the owning track id
    pub fn with_track_id(mut self, track_id: u32) -> Self {
        self.track_id = track_id;
        self
    }

    /// Sets the decode timestamp in seconds
    pub fn with_time(mut self, time: f64) -> Self {
        self.time = time;
        self
    }

    /// Sets the duration in seconds
    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Sets the keyframe flag
    pub fn with_key_flag(mut self, is_key: bool) -> Self {
        self.is_key = is_key;
        self
    }

    /// Sets the composition-time offset (PTS − DTS) in seconds
    pub fn with_composition_offset(mut self, offset: f64) -> Self {
        self.composition_offset = Some(offset);
        self
    }

    /// Sets an explicit presentation timestamp in seconds
    pub fn with_pts(mut self, pts: f64) -> Self {
        self.pts = Some(pts);
        self
    }

    /// Presentation timestamp: explicit PTS if set, otherwise DTS plus the
    /// composition offset, otherwise the DTS itself
    pub fn presentation_time(&self) -> f64 {
        match (self.pts, self.composition_offset) {
            (Some(pts), _) => pts,
            (None, Some(offset)) => self.time + offset,
            (None, None) => self.time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_chain() {
        let packet = Packet::new(vec![1, 2, 3])
            .with_track_id(2)
            .with_time(1.5)
            .with_duration(0.04)
            .with_key_flag(true);
        assert_eq!(packet.track_id, 2);
        assert_eq!(packet.time, 1.5);
        assert_eq!(packet.duration, Some(0.04));
        assert!(packet.is_key);
    }

    #[test]
    fn test_presentation_time_precedence() {
        let p = Packet::new(vec![]).with_time(1.0);
        assert_eq!(p.presentation_time(), 1.0);

        let p = Packet::new(vec![]).with_time(1.0).with_composition_offset(0.5);
        assert_eq!(p.presentation_time(), 1.5);

        let p = Packet::new(vec![])
            .with_time(1.0)
            .with_composition_offset(0.5)
            .with_pts(2.0);
        assert_eq!(p.presentation_time(), 2.0);
    }
}
