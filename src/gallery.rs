//! Output directory and file naming for captured images

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::CameraResult;
use crate::session::CaptureRequest;

const SNAPSHOT_DIR: &str = "snapshot";
const SNAPSHOT_NAME: &str = "pimage_snapshot.jpg";

#[derive(Debug, Clone)]
pub struct Gallery {
    root: PathBuf,
}

impl Gallery {
    /// Use `root` as the gallery, creating it if absent
    pub fn create(root: impl Into<PathBuf>) -> CameraResult<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(SNAPSHOT_DIR))?;
        info!("Gallery at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reserve `pimage_<unix-timestamp>.jpg`, suffixed `_<n>` when that
    /// second is already taken.
    ///
    /// The name is claimed by creating an empty file, so concurrent callers
    /// never get the same path. Hand the request back to [`Gallery::discard`]
    /// if the capture fails.
    pub fn timestamped(&self, at: DateTime<Utc>, make_raw: bool) -> CameraResult<CaptureRequest> {
        let ts = at.timestamp();
        let mut n = 0;
        loop {
            let path = match n {
                0 => self.root.join(format!("pimage_{ts}.jpg")),
                n => self.root.join(format!("pimage_{ts}_{n}.jpg")),
            };
            n += 1;
            if make_raw && path.with_extension("dng").exists() {
                continue;
            }
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(CaptureRequest::new(path, make_raw)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn next_capture(&self, make_raw: bool) -> CameraResult<CaptureRequest> {
        self.timestamped(Utc::now(), make_raw)
    }

    /// Drop the placeholder of a reservation whose capture never landed
    pub fn discard(&self, request: &CaptureRequest) {
        let empty = fs::metadata(&request.path).is_ok_and(|m| m.len() == 0);
        if empty {
            if let Err(e) = fs::remove_file(&request.path) {
                warn!("Cannot remove {}: {}", request.path.display(), e);
            }
        }
    }

    /// Fixed snapshot path, overwritten on every snapshot
    pub fn snapshot(&self) -> CaptureRequest {
        CaptureRequest::new(self.root.join(SNAPSHOT_DIR).join(SNAPSHOT_NAME), false)
    }

    /// JPEG file names in the gallery root, newest capture first. Names
    /// outside the `pimage_` scheme come last.
    pub fn list(&self) -> CameraResult<Vec<String>> {
        let mut names: Vec<String> = fs::read_dir(&self.root)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext.eq_ignore_ascii_case("jpg")))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort_unstable_by(|a, b| capture_order(b).cmp(&capture_order(a)).then_with(|| b.cmp(a)));
        Ok(names)
    }
}

/// `(timestamp, suffix)` of a `pimage_<ts>[_<n>].jpg` name
fn capture_order(name: &str) -> Option<(i64, u64)> {
    let stem = name.strip_prefix("pimage_")?.strip_suffix(".jpg")?;
    match stem.split_once('_') {
        Some((ts, n)) => Some((ts.parse().ok()?, n.parse().ok()?)),
        None => Some((stem.parse().ok()?, 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_create_makes_directories() {
        let dir = tempfile::tempdir().unwrap();
        let gallery = Gallery::create(dir.path().join("static/gallery")).unwrap();
        assert!(gallery.root().is_dir());
        assert!(gallery.root().join("snapshot").is_dir());
    }

    #[test]
    fn test_timestamped_naming() {
        let dir = tempfile::tempdir().unwrap();
        let gallery = Gallery::create(dir.path()).unwrap();

        let request = gallery.timestamped(at(1_700_000_000), true).unwrap();
        assert_eq!(request.path, dir.path().join("pimage_1700000000.jpg"));
        assert_eq!(request.raw_path(), Some(dir.path().join("pimage_1700000000.dng")));
    }

    #[test]
    fn test_same_second_gets_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let gallery = Gallery::create(dir.path()).unwrap();

        fs::write(dir.path().join("pimage_42.jpg"), b"x").unwrap();
        fs::write(dir.path().join("pimage_42_1.jpg"), b"x").unwrap();
        let request = gallery.timestamped(at(42), false).unwrap();
        assert_eq!(request.path, dir.path().join("pimage_42_2.jpg"));
    }

    #[test]
    fn test_reservations_in_same_second_never_collide() {
        let dir = tempfile::tempdir().unwrap();
        let gallery = Arc::new(Gallery::create(dir.path()).unwrap());

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let gallery = gallery.clone();
                std::thread::spawn(move || {
                    (0..4)
                        .map(|_| gallery.timestamped(at(7), false).unwrap().path)
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut paths: Vec<PathBuf> = workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect();
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), 32);
    }

    #[test]
    fn test_two_reservations_then_two_writes_keep_both() {
        let dir = tempfile::tempdir().unwrap();
        let gallery = Gallery::create(dir.path()).unwrap();
        let a = gallery.timestamped(at(9), false).unwrap();
        let b = gallery.timestamped(at(9), false).unwrap();
        assert_ne!(a.path, b.path);

        fs::write(&a.path, b"first").unwrap();
        fs::write(&b.path, b"second").unwrap();
        assert_eq!(gallery.list().unwrap(), vec!["pimage_9_1.jpg", "pimage_9.jpg"]);
    }

    #[test]
    fn test_discard_removes_only_empty_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let gallery = Gallery::create(dir.path()).unwrap();

        let failed = gallery.timestamped(at(5), false).unwrap();
        gallery.discard(&failed);
        assert!(!failed.path.exists());

        let written = gallery.timestamped(at(5), false).unwrap();
        fs::write(&written.path, b"jpeg").unwrap();
        gallery.discard(&written);
        assert!(written.path.exists());
    }

    #[test]
    fn test_list_orders_suffixes_numerically() {
        let dir = tempfile::tempdir().unwrap();
        let gallery = Gallery::create(dir.path()).unwrap();
        for name in ["pimage_5_9.jpg", "pimage_5_10.jpg", "pimage_5.jpg", "pimage_40.jpg", "holiday.jpg"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        assert_eq!(
            gallery.list().unwrap(),
            vec!["pimage_40.jpg", "pimage_5_10.jpg", "pimage_5_9.jpg", "pimage_5.jpg", "holiday.jpg"]
        );
    }

    #[test]
    fn test_snapshot_path() {
        let dir = tempfile::tempdir().unwrap();
        let gallery = Gallery::create(dir.path()).unwrap();
        let request = gallery.snapshot();
        assert_eq!(request.path, dir.path().join("snapshot/pimage_snapshot.jpg"));
        assert!(!request.make_raw);
    }

    #[test]
    fn test_list_only_jpegs_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let gallery = Gallery::create(dir.path()).unwrap();
        for name in ["pimage_1.jpg", "pimage_3.jpg", "pimage_2.jpg", "pimage_3.dng"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        assert_eq!(
            gallery.list().unwrap(),
            vec!["pimage_3.jpg", "pimage_2.jpg", "pimage_1.jpg"]
        );
    }
}
