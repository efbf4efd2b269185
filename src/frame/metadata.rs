//! Structured per-frame metadata.
//!
//! Every frame carries one `FrameMetadata` record: the acquisition context a
//! downstream consumer needs to interpret the pixels (device, exposure,
//! probe pose, signal quality) plus a free-form string map for anything the
//! vendor attaches that has no structured home (timecodes, raw flags).
//!
//! The record is serde-serializable because it is embedded verbatim in the
//! region metadata document's `last_frame` object on every publish, which is
//! how mapped-frame readers recover it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Structured metadata attached to a [`Frame`](crate::frame::Frame).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    /// Identifier of the device that produced the frame.
    pub device_id: String,
    /// Exposure time in milliseconds, when the source reports one.
    pub exposure_time_ms: f64,
    /// Hardware frame number as counted by the source.
    pub frame_number: u64,
    /// Processing flags mirrored from the slot header on mapped reads
    /// (bit 0 = zero-copy republish).
    pub processing_flags: u32,
    /// Probe position in scanner coordinates, when tracking is present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe_position: Option<[f32; 3]>,
    /// Probe orientation quaternion (x, y, z, w).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe_orientation: Option<[f32; 4]>,
    /// Input signal strength in `[0, 1]`.
    pub signal_strength: f32,
    /// Signal-to-noise ratio in dB.
    pub snr_db: f32,
    /// Aggregate image quality score in `[0, 1]`.
    pub quality_score: f32,
    /// Free-form attributes (timecode, vendor flags, ...).
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl Default for FrameMetadata {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            exposure_time_ms: 0.0,
            frame_number: 0,
            processing_flags: 0,
            probe_position: None,
            probe_orientation: None,
            signal_strength: 0.0,
            snr_db: 0.0,
            quality_score: 0.0,
            attributes: HashMap::new(),
        }
    }
}

impl FrameMetadata {
    /// Signal-quality fields derived from the vendor's "signal locked" flag,
    /// the only quality indication most capture hardware exposes.
    pub fn from_signal_lock(device_id: &str, frame_number: u64, locked: bool) -> Self {
        Self {
            device_id: device_id.to_string(),
            frame_number,
            signal_strength: if locked { 0.9 } else { 0.0 },
            snr_db: if locked { 35.0 } else { 0.0 },
            quality_score: if locked { 0.9 } else { 0.0 },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_round_trip() {
        let mut meta = FrameMetadata {
            device_id: "dev1".to_string(),
            exposure_time_ms: 8.3,
            frame_number: 42,
            probe_position: Some([1.0, 2.0, 3.0]),
            probe_orientation: Some([0.0, 0.0, 0.0, 1.0]),
            ..Default::default()
        };
        meta.attributes
            .insert("timecode".to_string(), "01:02:03:04".to_string());

        let json = serde_json::to_string(&meta).unwrap();
        let back: FrameMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn test_signal_lock_derivation() {
        let locked = FrameMetadata::from_signal_lock("dev1", 7, true);
        assert!(locked.signal_strength > 0.0);
        assert!(locked.snr_db > 0.0);

        let unlocked = FrameMetadata::from_signal_lock("dev1", 8, false);
        assert_eq!(unlocked.signal_strength, 0.0);
        assert_eq!(unlocked.snr_db, 0.0);
    }

    #[test]
    fn test_optional_pose_omitted_from_json() {
        let meta = FrameMetadata::default();
        let json = serde_json::to_string(&meta).unwrap();
        assert!(!json.contains("probe_position"));
        assert!(!json.contains("probe_orientation"));
    }
}
