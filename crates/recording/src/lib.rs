//! Wave video capture and session directory management.
//!
//! While tracking is on, an external transcoder keeps a rolling capture of
//! the RTSP stream in a `temp_` file. When the auto-recorder (or the
//! operator) raises `start_recording`, the current position marks a wave
//! start; when the flag drops again the capture is stopped and re-cut into
//! a numbered clip with a few seconds of pre-roll. Clips land in a
//! per-session directory named after `SessionID`, `other/` when no session
//! is active.
//!
//! On session stop only integer-named files with recognized video
//! extensions survive in the session directory; everything else is debris
//! from interrupted captures and is deleted.

use bus::{CameraState, Commands, StateBus, WebApp};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transcoder exited with status {0}")]
    Transcoder(std::process::ExitStatus),
    #[error("transcoder timed out")]
    Timeout,
}

/// File extensions that count as finished video clips.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "avi", "mov"];

/// Recorder configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory holding one subdirectory per session
    pub videos_root: PathBuf,
    /// RTSP source of the camera video stream
    pub rtsp_url: String,
    /// Waves shorter than this are discarded, seconds
    pub min_clip_secs: f64,
    /// Pre-roll kept before the wave start, seconds
    pub pre_roll_secs: f64,
    /// Sessions older than this are pruned at boot, days
    pub max_session_age_days: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            videos_root: PathBuf::from("/var/lib/surfcam/videos"),
            rtsp_url: "rtsp://127.0.0.1/stream".into(),
            min_clip_secs: 3.0,
            pre_roll_secs: 8.0,
            max_session_age_days: 7,
        }
    }
}

/// Offset into the capture where the clip should begin.
pub fn clip_start(wave_offset_secs: f64, pre_roll_secs: f64) -> f64 {
    (wave_offset_secs - pre_roll_secs).max(0.0)
}

/// Directory for a session id; -1 means no session.
pub fn session_dir(root: &Path, session_id: i64) -> PathBuf {
    if session_id == -1 {
        root.join("other")
    } else {
        root.join(session_id.to_string())
    }
}

/// Delete everything in a finished session directory except integer-named
/// video files.
pub fn finalize_session_dir(dir: &Path) -> Result<(), RecordingError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let keep = path
            .file_stem()
            .and_then(|s| s.to_str())
            .is_some_and(|s| s.parse::<u64>().is_ok())
            && path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| VIDEO_EXTENSIONS.contains(&e));
        if !keep {
            debug!(path = %path.display(), "Removing non-clip file from session");
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Remove session directories whose last modification is older than
/// `max_age_days`. Called once at boot.
pub fn prune_old_sessions(root: &Path, max_age_days: u64) {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    let cutoff = SystemTime::now() - Duration::from_secs(max_age_days * 86_400);
    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let old = entry
            .metadata()
            .and_then(|m| m.modified())
            .map(|modified| modified < cutoff)
            .unwrap_or(false);
        if old {
            info!(path = %path.display(), "Pruning old session directory");
            if let Err(e) = std::fs::remove_dir_all(&path) {
                warn!(?e, path = %path.display(), "Session prune failed");
            }
        }
    }
}

fn count_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|e| e.path().is_file())
                .count()
        })
        .unwrap_or(0)
}

/// A running rolling capture.
struct Capture {
    child: Child,
    path: PathBuf,
    started: Instant,
}

/// The video recorder task.
pub struct Recorder {
    bus: Arc<StateBus>,
    commands: Commands,
    cam_state: CameraState,
    webapp: WebApp,
    config: Config,
    capture: Option<Capture>,
    wave_nr: usize,
    wave_started: Option<Instant>,
    current_dir: PathBuf,
}

impl Recorder {
    pub fn new(bus: Arc<StateBus>, config: Config) -> Self {
        Self {
            commands: Commands::new(bus.clone()),
            cam_state: CameraState::new(bus.clone()),
            webapp: WebApp::new(bus.clone()),
            bus,
            current_dir: config.videos_root.join("other"),
            config,
            capture: None,
            wave_nr: 0,
            wave_started: None,
        }
    }

    /// Run until the shared stop flag is raised.
    pub fn run(&mut self) {
        self.cam_state.set_is_recording(false);
        self.cam_state.set_start_recording(false);

        self.current_dir = session_dir(&self.config.videos_root, self.webapp.session_id());
        if let Err(e) = std::fs::create_dir_all(&self.current_dir) {
            error!(?e, dir = %self.current_dir.display(), "Cannot create session directory");
        }
        self.wave_nr = count_files(&self.current_dir);
        info!(dir = %self.current_dir.display(), "Recorder started");

        while !self.bus.stop_requested() {
            std::thread::sleep(Duration::from_millis(20));
            self.tick();
        }

        // Shutting down mid-capture leaves no temp debris behind.
        self.abort_capture();
        if let Err(e) = finalize_session_dir(&self.current_dir) {
            warn!(?e, "Session cleanup failed on shutdown");
        }
        info!("Recorder stopped");
    }

    fn tick(&mut self) {
        let session_id = self.webapp.session_id();
        let desired = session_dir(&self.config.videos_root, session_id);
        if desired != self.current_dir {
            self.switch_session_dir(desired, session_id);
        }

        if self.commands.tracking_enabled() {
            if self.capture.is_none() {
                self.start_capture();
            }

            let start_flag = self.cam_state.start_recording();
            let in_wave = self.cam_state.is_recording();

            if self.capture.is_some() && start_flag && !in_wave {
                info!(wave = self.wave_nr, "Wave started");
                self.cam_state.set_is_recording(true);
                self.wave_started = Some(Instant::now());
            }

            if self.capture.is_some() && !start_flag && in_wave {
                self.finish_wave();
            }
        } else if self.capture.is_some() {
            info!("Tracking stopped, discarding open capture");
            self.abort_capture();
        }
    }

    /// Session switch: whatever was in flight belongs to the old session
    /// and is dropped, and the old directory is cleaned to clips only.
    fn switch_session_dir(&mut self, desired: PathBuf, session_id: i64) {
        self.abort_capture();
        if let Err(e) = finalize_session_dir(&self.current_dir) {
            warn!(?e, dir = %self.current_dir.display(), "Session cleanup failed");
        }

        if session_id != -1 {
            let start = SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);
            self.webapp.set_session_start_time(start);
        }

        self.current_dir = desired;
        if let Err(e) = std::fs::create_dir_all(&self.current_dir) {
            error!(?e, dir = %self.current_dir.display(), "Cannot create session directory");
        }
        self.wave_nr = count_files(&self.current_dir);
        info!(dir = %self.current_dir.display(), waves = self.wave_nr, "Recording directory switched");
    }

    fn start_capture(&mut self) {
        let path = self.current_dir.join(format!("temp_{}.mp4", self.wave_nr));
        match spawn_capture(&self.config.rtsp_url, &path) {
            Ok(child) => {
                info!(path = %path.display(), "Rolling capture started");
                self.capture = Some(Capture {
                    child,
                    path,
                    started: Instant::now(),
                });
            }
            Err(e) => {
                // The stream may come up late; retried next tick.
                warn!(?e, "Capture start failed");
            }
        }
    }

    /// Close out a wave: keep it as a numbered clip when long enough,
    /// discard it otherwise.
    fn finish_wave(&mut self) {
        self.cam_state.set_is_recording(false);
        let Some(capture) = self.capture.take() else {
            return;
        };
        let Some(wave_started) = self.wave_started.take() else {
            discard_capture(capture);
            return;
        };

        let wave_secs = wave_started.elapsed().as_secs_f64();
        if wave_secs <= self.config.min_clip_secs {
            info!(wave_secs, "Wave too short, ignoring");
            discard_capture(capture);
            return;
        }

        let output = self.current_dir.join(format!("{}.mp4", self.wave_nr));
        self.wave_nr += 1;
        let offset = clip_start(
            wave_started.duration_since(capture.started).as_secs_f64(),
            self.config.pre_roll_secs,
        );
        let temp = capture.path.clone();
        stop_capture(capture);
        match cut_clip(&temp, &output, offset) {
            Ok(()) => info!(clip = %output.display(), "Wave clip saved"),
            Err(e) => error!(?e, "Clipping failed"),
        }
        if temp.exists() {
            if let Err(e) = std::fs::remove_file(&temp) {
                warn!(?e, "Temp capture removal failed");
            }
        }
    }

    /// Stop any in-flight capture and delete its temp file.
    fn abort_capture(&mut self) {
        self.cam_state.set_is_recording(false);
        self.wave_started = None;
        if let Some(capture) = self.capture.take() {
            discard_capture(capture);
        }
    }
}

fn spawn_capture(rtsp_url: &str, output: &Path) -> Result<Child, RecordingError> {
    let child = Command::new("ffmpeg")
        .args(["-i", rtsp_url, "-c:v", "copy", "-y"])
        .arg(output)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    Ok(child)
}

/// Ask the transcoder to stop, escalating to a kill after two seconds.
fn stop_capture(mut capture: Capture) {
    if let Some(stdin) = capture.child.stdin.as_mut() {
        let _ = stdin.write_all(b"q");
    }
    drop(capture.child.stdin.take());

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        match capture.child.try_wait() {
            Ok(Some(status)) => {
                debug!(?status, "Capture stopped");
                return;
            }
            Ok(None) if Instant::now() >= deadline => {
                warn!("Capture did not stop in time, killing");
                let _ = capture.child.kill();
                let _ = capture.child.wait();
                return;
            }
            Ok(None) => std::thread::sleep(Duration::from_millis(50)),
            Err(e) => {
                error!(?e, "Capture wait failed, killing");
                let _ = capture.child.kill();
                let _ = capture.child.wait();
                return;
            }
        }
    }
}

fn discard_capture(capture: Capture) {
    let path = capture.path.clone();
    stop_capture(capture);
    if path.exists() {
        if let Err(e) = std::fs::remove_file(&path) {
            warn!(?e, path = %path.display(), "Temp capture removal failed");
        } else {
            debug!(path = %path.display(), "Discarded capture");
        }
    }
}

/// Re-cut the rolling capture into the final clip without re-encoding.
fn cut_clip(input: &Path, output: &Path, start_secs: f64) -> Result<(), RecordingError> {
    if !input.exists() {
        warn!(input = %input.display(), "Nothing to clip");
        return Ok(());
    }
    let mut child = Command::new("ffmpeg")
        .arg("-i")
        .arg(input)
        .args(["-ss", &format!("{start_secs:.2}"), "-c", "copy", "-y"])
        .arg(output)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    let deadline = Instant::now() + Duration::from_secs(60);
    loop {
        match child.try_wait()? {
            Some(status) if status.success() => return Ok(()),
            Some(status) => return Err(RecordingError::Transcoder(status)),
            None if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(RecordingError::Timeout);
            }
            None => std::thread::sleep(Duration::from_millis(100)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_start_applies_pre_roll() {
        assert_eq!(clip_start(20.0, 8.0), 12.0);
        // Wave started right after the capture: never negative.
        assert_eq!(clip_start(3.0, 8.0), 0.0);
    }

    #[test]
    fn test_session_dir_naming() {
        let root = Path::new("/videos");
        assert_eq!(session_dir(root, 42), PathBuf::from("/videos/42"));
        assert_eq!(session_dir(root, -1), PathBuf::from("/videos/other"));
    }

    #[test]
    fn test_finalize_keeps_only_numbered_clips() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "0.mp4",
            "1.mkv",
            "12.mov",
            "temp_2.mp4",
            "notes.txt",
            "3.jpeg",
            "wave.mp4",
        ] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        finalize_session_dir(dir.path()).unwrap();

        let mut remaining: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        remaining.sort();
        assert_eq!(remaining, vec!["0.mp4", "1.mkv", "12.mov"]);
    }

    #[test]
    fn test_finalize_leaves_subdirectories_alone() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("temp_0.mp4"), b"x").unwrap();

        finalize_session_dir(dir.path()).unwrap();

        assert!(dir.path().join("nested").is_dir());
        assert!(!dir.path().join("temp_0.mp4").exists());
    }

    #[test]
    fn test_prune_spares_fresh_sessions() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("123")).unwrap();
        prune_old_sessions(root.path(), 7);
        assert!(root.path().join("123").is_dir());
    }
}
