//! Daemon configuration file.
//!
//! Everything deployment-specific lives here: serial port hints, the
//! tracker acceptance region, the lens zoom table and the video paths.
//! Every field has a default matching the reference installation, so an
//! absent file or empty section is fine.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;
use tracking::zoomctl::ZoomTable;
use types::AcceptRegion;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SurfcamConfig {
    pub daemon: DaemonSection,
    pub frontboard: FrontBoardSection,
    pub zoom: ZoomSection,
    pub tracker: TrackerSection,
    pub tracking: TrackingSection,
    pub recording: RecordingSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonSection {
    /// Persisted calibration/state file
    pub state_file: PathBuf,
    /// Directory for the rolling daemon log
    pub log_dir: PathBuf,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("/var/lib/surfcam/state.json"),
            log_dir: PathBuf::from("/var/log/surfcam"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FrontBoardSection {
    pub port_hint: String,
    pub baud_rate: u32,
}

impl Default for FrontBoardSection {
    fn default() -> Self {
        let base = frontboard::Config::default();
        Self {
            port_hint: base.port_hint,
            baud_rate: base.baud_rate,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ZoomSection {
    pub port_hint: String,
    pub baud_rate: u32,
}

impl Default for ZoomSection {
    fn default() -> Self {
        let base = zoom::Config::default();
        Self {
            port_hint: base.port_hint,
            baud_rate: base.baud_rate,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrackerSection {
    /// Integer degrees a fix must truncate to for acceptance
    pub region_lat: i32,
    pub region_lon: i32,
}

impl Default for TrackerSection {
    fn default() -> Self {
        let region = AcceptRegion::default();
        Self {
            region_lat: region.lat_deg,
            region_lon: region.lon_deg,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrackingSection {
    pub motor_update_hz: f64,
    pub min_track_distance_m: f64,
    pub angle_error_threshold_deg: f64,
    /// `[distance_m, zoom_level]` pairs; empty uses the built-in lens table
    pub zoom_table: Vec<[f64; 2]>,
}

impl Default for TrackingSection {
    fn default() -> Self {
        let base = tracking::Config::default();
        Self {
            motor_update_hz: base.motor_update_hz,
            min_track_distance_m: base.min_track_distance_m,
            angle_error_threshold_deg: base.angle_error_threshold_deg,
            zoom_table: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecordingSection {
    pub videos_root: PathBuf,
    pub rtsp_url: String,
    pub min_clip_secs: f64,
    pub pre_roll_secs: f64,
    pub max_session_age_days: u64,
}

impl Default for RecordingSection {
    fn default() -> Self {
        let base = recording::Config::default();
        Self {
            videos_root: base.videos_root,
            rtsp_url: base.rtsp_url,
            min_clip_secs: base.min_clip_secs,
            pre_roll_secs: base.pre_roll_secs,
            max_session_age_days: base.max_session_age_days,
        }
    }
}

impl SurfcamConfig {
    /// Load the TOML file at `path`; a missing file is the default setup.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                let config = toml::from_str(&text)
                    .with_context(|| format!("parsing {}", path.display()))?;
                info!(path = %path.display(), "Configuration loaded");
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No configuration file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    pub fn region(&self) -> AcceptRegion {
        AcceptRegion {
            lat_deg: self.tracker.region_lat,
            lon_deg: self.tracker.region_lon,
        }
    }

    pub fn tracking_config(&self) -> tracking::Config {
        let base = tracking::Config::default();
        tracking::Config {
            frontboard: frontboard::Config {
                port_hint: self.frontboard.port_hint.clone(),
                baud_rate: self.frontboard.baud_rate,
                ..frontboard::Config::default()
            },
            zoom_link: zoom::Config {
                port_hint: self.zoom.port_hint.clone(),
                baud_rate: self.zoom.baud_rate,
                ..zoom::Config::default()
            },
            region: self.region(),
            zoom_table: if self.tracking.zoom_table.is_empty() {
                ZoomTable::default()
            } else {
                ZoomTable::new(
                    self.tracking
                        .zoom_table
                        .iter()
                        .map(|pair| (pair[0], pair[1]))
                        .collect(),
                )
            },
            motor_update_hz: self.tracking.motor_update_hz,
            min_track_distance_m: self.tracking.min_track_distance_m,
            angle_error_threshold_deg: self.tracking.angle_error_threshold_deg,
            state_path: self.daemon.state_file.clone(),
            ..base
        }
    }

    pub fn recording_config(&self) -> recording::Config {
        recording::Config {
            videos_root: self.recording.videos_root.clone(),
            rtsp_url: self.recording.rtsp_url.clone(),
            min_clip_secs: self.recording.min_clip_secs,
            pre_roll_secs: self.recording.pre_roll_secs,
            max_session_age_days: self.recording.max_session_age_days,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_parses_to_defaults() {
        let config: SurfcamConfig = toml::from_str("").unwrap();
        assert_eq!(config.frontboard.port_hint, "Surf Front Board");
        assert_eq!(config.zoom.baud_rate, 9600);
        assert_eq!(config.tracker.region_lat, 38);
        assert_eq!(config.tracker.region_lon, -9);
    }

    #[test]
    fn test_partial_config_overrides() {
        let config: SurfcamConfig = toml::from_str(
            r#"
            [tracker]
            region_lat = 41
            region_lon = -8

            [tracking]
            motor_update_hz = 5.0
            zoom_table = [[1.0, 1.0], [50.0, 4.0], [600.0, 25.0]]
            "#,
        )
        .unwrap();
        assert_eq!(config.region().lat_deg, 41);
        let tracking = config.tracking_config();
        assert!((tracking.motor_update_hz - 5.0).abs() < 1e-12);
        assert!((tracking.zoom_table.level_for(25.5) - 2.5).abs() < 1e-9);
    }
}
