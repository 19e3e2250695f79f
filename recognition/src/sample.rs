use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Capture;
use crate::deadline::Deadline;
use crate::error::ErrorKind;

/// Hard ceiling on either side of a capture, whatever the configuration says.
pub const MAX_SIDE: u32 = 4096;

/// Filesystem timestamps may trail the wall clock by a scheduler tick.
const MTIME_SLACK: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("fingerprint sensor unavailable: {0}")]
    Unavailable(String),
    #[error("no finger presented before the deadline")]
    Timeout,
    #[error("failed to read capture: {0}")]
    Io(#[from] io::Error),
    #[error("failed to decode capture: {0}")]
    Decode(#[from] image::ImageError),
    #[error("capture of {width}x{height} does not match {len} pixels")]
    InvalidDimensions { width: u32, height: u32, len: usize },
    #[error("capture of {width}x{height} exceeds the {max_width}x{max_height} limit")]
    TooLarge {
        width: u32,
        height: u32,
        max_width: u32,
        max_height: u32,
    },
    #[error("refusing untrusted capture {0}")]
    Untrusted(PathBuf),
}

impl CaptureError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CaptureError::Unavailable(_) | CaptureError::Io(_) | CaptureError::Untrusted(_) => {
                ErrorKind::SensorUnavailable
            }
            CaptureError::Timeout => ErrorKind::Timeout,
            CaptureError::Decode(_)
            | CaptureError::InvalidDimensions { .. }
            | CaptureError::TooLarge { .. } => ErrorKind::EmptyCapture,
        }
    }
}

/// One grayscale capture, dark ridges on a light background.
///
/// Lives only for the duration of one attempt: it is consumed by feature
/// extraction and never written anywhere.
#[derive(Clone)]
pub struct FingerprintSample {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    dpi: u32,
    captured_at: DateTime<Utc>,
}

// Pixel data stays out of debug output.
impl std::fmt::Debug for FingerprintSample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FingerprintSample")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("dpi", &self.dpi)
            .field("captured_at", &self.captured_at)
            .finish_non_exhaustive()
    }
}

impl FingerprintSample {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>, dpi: u32) -> Result<Self, CaptureError> {
        check_size(width, height, MAX_SIDE, MAX_SIDE)?;
        if width == 0 || height == 0 || pixels.len() != width as usize * height as usize {
            return Err(CaptureError::InvalidDimensions {
                width,
                height,
                len: pixels.len(),
            });
        }

        Ok(Self {
            pixels,
            width,
            height,
            dpi,
            captured_at: Utc::now(),
        })
    }

    pub fn from_image(image: &image::DynamicImage, dpi: u32) -> Result<Self, CaptureError> {
        let gray = image.to_luma8();
        let (width, height) = gray.dimensions();
        Self::new(width, height, gray.into_raw(), dpi)
    }

    pub fn open(path: &Path, dpi: u32) -> Result<Self, CaptureError> {
        Self::open_within(path, dpi, MAX_SIDE, MAX_SIDE)
    }

    /// Like [`open`](Self::open), but refuses images larger than
    /// `max_width` x `max_height` before decoding any pixel data.
    pub fn open_within(
        path: &Path,
        dpi: u32,
        max_width: u32,
        max_height: u32,
    ) -> Result<Self, CaptureError> {
        let (width, height) = image::image_dimensions(path)?;
        check_size(width, height, max_width, max_height)?;
        let image = image::open(path)?;
        Self::from_image(&image, dpi)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dpi(&self) -> u32 {
        self.dpi
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

fn check_size(
    width: u32,
    height: u32,
    max_width: u32,
    max_height: u32,
) -> Result<(), CaptureError> {
    if width > max_width || height > max_height {
        return Err(CaptureError::TooLarge {
            width,
            height,
            max_width,
            max_height,
        });
    }
    Ok(())
}

/// Where samples come from. Sensor drivers live behind this trait.
pub trait SampleSource {
    fn capture(&mut self, deadline: &Deadline) -> Result<FingerprintSample, CaptureError>;
}

/// Picks up frames that an external sensor daemon drops into a spool file.
///
/// Polls until a frame written after the attempt started appears or the
/// deadline passes, and removes it after reading so a frame is never used
/// twice. Older frames are discarded. A frame that is not a regular file
/// owned by `owner`, or that group or others may write, is removed and
/// refused.
pub struct FileSampleSource {
    path: PathBuf,
    dpi: u32,
    max_width: u32,
    max_height: u32,
    owner: u32,
    poll: Duration,
}

impl FileSampleSource {
    pub fn new(path: impl Into<PathBuf>, dpi: u32) -> Self {
        let defaults = Capture::default();
        Self {
            path: path.into(),
            dpi,
            max_width: defaults.max_width,
            max_height: defaults.max_height,
            owner: defaults.owner_uid,
            poll: Duration::from_millis(50),
        }
    }

    pub fn from_config(config: &Capture) -> Self {
        Self::new(&config.path, config.dpi)
            .with_limits(config.max_width, config.max_height)
            .with_owner(config.owner_uid)
    }

    pub fn with_limits(mut self, max_width: u32, max_height: u32) -> Self {
        self.max_width = max_width;
        self.max_height = max_height;
        self
    }

    pub fn with_owner(mut self, uid: u32) -> Self {
        self.owner = uid;
        self
    }

    fn discard(&self, why: &str) {
        debug!("discarding {} capture {}", why, self.path.display());
        if let Err(err) = fs::remove_file(&self.path) {
            warn!("failed to remove capture {}: {err}", self.path.display());
        }
    }

    /// Whether a usable frame is waiting in the spool.
    fn frame_ready(&self, deadline: &Deadline) -> Result<bool, CaptureError> {
        let meta = match fs::symlink_metadata(&self.path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        };

        if !meta.file_type().is_file() || meta.uid() != self.owner || meta.mode() & 0o022 != 0 {
            self.discard("untrusted");
            return Err(CaptureError::Untrusted(self.path.clone()));
        }

        if meta.modified()? + MTIME_SLACK < deadline.opened_at() {
            self.discard("stale");
            return Ok(false);
        }

        Ok(true)
    }
}

impl SampleSource for FileSampleSource {
    fn capture(&mut self, deadline: &Deadline) -> Result<FingerprintSample, CaptureError> {
        let spool = self
            .path
            .parent()
            .ok_or_else(|| CaptureError::Unavailable("capture path has no parent".into()))?;
        if !spool.is_dir() {
            return Err(CaptureError::Unavailable(format!(
                "{} does not exist",
                spool.display()
            )));
        }

        while !self.frame_ready(deadline)? {
            if deadline.expired() {
                return Err(CaptureError::Timeout);
            }
            thread::sleep(self.poll.min(deadline.remaining()));
        }

        debug!("reading capture from {}", self.path.display());
        let sample =
            FingerprintSample::open_within(&self.path, self.dpi, self.max_width, self.max_height);
        if let Err(err) = fs::remove_file(&self.path) {
            warn!("failed to remove capture {}: {err}", self.path.display());
        }

        sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{File, OpenOptions};
    use std::os::unix::fs::PermissionsExt;
    use std::time::SystemTime;

    /// Writes a `width` x `height` frame the way the sensor daemon does.
    fn drop_frame(path: &Path, width: u32, height: u32) {
        image::GrayImage::from_fn(width, height, |x, y| image::Luma([(x * 10 + y) as u8]))
            .save(path)
            .unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).unwrap();
    }

    /// A source trusting frames owned by whoever runs the tests.
    fn source_in(dir: &Path, name: &str) -> FileSampleSource {
        let uid = fs::metadata(dir).unwrap().uid();
        FileSampleSource::new(dir.join(name), 500).with_owner(uid)
    }

    #[test]
    fn rejects_mismatched_buffer() {
        let err = FingerprintSample::new(4, 4, vec![0; 15], 500).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmptyCapture);
    }

    #[test]
    fn rejects_oversized_buffer() {
        let side = MAX_SIDE + 1;
        let err = FingerprintSample::new(side, 1, vec![0; side as usize], 500).unwrap_err();
        assert!(matches!(err, CaptureError::TooLarge { .. }), "{err:?}");
    }

    #[test]
    fn file_source_consumes_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = source_in(dir.path(), "capture.png");
        let deadline = Deadline::unbounded();
        let path = dir.path().join("capture.png");
        drop_frame(&path, 8, 6);

        let sample = source.capture(&deadline).unwrap();
        assert_eq!((sample.width(), sample.height()), (8, 6));
        assert_eq!(sample.pixels()[9], 11);
        assert!(!path.exists());
    }

    #[test]
    fn file_source_times_out_without_finger() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = source_in(dir.path(), "capture.png");
        let err = source
            .capture(&Deadline::after(Duration::from_millis(20)))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn missing_spool_means_no_sensor() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = FileSampleSource::new(dir.path().join("nope/capture.png"), 500);
        let err = source.capture(&Deadline::unbounded()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SensorUnavailable);
    }

    #[test]
    fn leftover_frame_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.png");
        drop_frame(&path, 8, 6);
        let old = SystemTime::now() - Duration::from_secs(60);
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(old)
            .unwrap();

        let mut source = source_in(dir.path(), "capture.png");
        let err = source
            .capture(&Deadline::after(Duration::from_millis(100)))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(!path.exists());
    }

    #[test]
    fn frame_from_another_owner_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let uid = fs::metadata(dir.path()).unwrap().uid();
        let path = dir.path().join("capture.png");
        let mut source = FileSampleSource::new(&path, 500).with_owner(uid.wrapping_add(1));
        let deadline = Deadline::unbounded();
        drop_frame(&path, 8, 6);

        let err = source.capture(&deadline).unwrap_err();
        assert!(matches!(err, CaptureError::Untrusted(_)), "{err:?}");
        assert_eq!(err.kind(), ErrorKind::SensorUnavailable);
        assert!(!path.exists());
    }

    #[test]
    fn world_writable_frame_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = source_in(dir.path(), "capture.png");
        let deadline = Deadline::unbounded();
        let path = dir.path().join("capture.png");
        drop_frame(&path, 8, 6);
        fs::set_permissions(&path, fs::Permissions::from_mode(0o622)).unwrap();

        let err = source.capture(&deadline).unwrap_err();
        assert!(matches!(err, CaptureError::Untrusted(_)), "{err:?}");
    }

    #[test]
    fn oversized_frame_is_refused_before_decoding() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = source_in(dir.path(), "capture.png").with_limits(64, 64);
        let deadline = Deadline::unbounded();
        let path = dir.path().join("capture.png");
        drop_frame(&path, 65, 8);

        let err = source.capture(&deadline).unwrap_err();
        assert!(matches!(err, CaptureError::TooLarge { width: 65, .. }), "{err:?}");
        assert_eq!(err.kind(), ErrorKind::EmptyCapture);
        assert!(!path.exists());
    }

    #[test]
    fn truncated_frame_fails_to_decode() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = source_in(dir.path(), "capture.png");
        let deadline = Deadline::unbounded();
        let path = dir.path().join("capture.png");
        File::create(&path).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();

        let err = source.capture(&deadline).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmptyCapture);
    }
}
