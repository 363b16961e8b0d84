use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use opencv::core::{self, Mat, Scalar, Vector};
use opencv::imgcodecs;
use opencv::imgproc;
use opencv::prelude::*;

use crate::analytics::{class_name, Detection};
use crate::config::SaveConfig;
use crate::tracking::Track;

use super::StorageError;

pub const FRAMES_DIR: &str = "frames";

pub struct FrameWriter {
    stream_id: String,
    dir: PathBuf,
    params: Vector<i32>,
}

impl FrameWriter {
    pub fn new(stream_id: &str, output_dir: &Path, save: &SaveConfig) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            dir: output_dir.join(FRAMES_DIR),
            params: Vector::from_slice(&[imgcodecs::IMWRITE_JPEG_QUALITY, save.jpeg_quality]),
        }
    }

    pub fn save_detection(
        &self,
        frame: &Mat,
        track: &Track,
        detection: &Detection,
        at: DateTime<Utc>,
    ) -> Result<PathBuf, StorageError> {
        let mut annotated = frame.try_clone()?;
        annotate(&mut annotated, track, detection)?;

        let class = class_name(track.class_id).replace(' ', "_");
        let path = self.dir.join(format!(
            "{}_{}_{}_{}.jpg",
            class,
            self.stream_id,
            track.id,
            stamp(at)
        ));
        self.write(&path, &annotated)?;
        Ok(path)
    }

    pub fn save_frame(&self, frame: &Mat, at: DateTime<Utc>) -> Result<PathBuf, StorageError> {
        let path = self
            .dir
            .join(format!("frame_{}_{}.jpg", self.stream_id, stamp(at)));
        self.write(&path, frame)?;
        Ok(path)
    }

    fn write(&self, path: &Path, frame: &Mat) -> Result<(), StorageError> {
        std::fs::create_dir_all(&self.dir)?;
        let target = path.to_string_lossy();
        if !imgcodecs::imwrite(&target, frame, &self.params)? {
            return Err(StorageError::Encode(path.to_path_buf()));
        }
        tracing::debug!(stream = %self.stream_id, path = %path.display(), "frame saved");
        Ok(())
    }
}

fn stamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d_%H%M%S_%3f").to_string()
}

fn annotate(frame: &mut Mat, track: &Track, detection: &Detection) -> opencv::Result<()> {
    let green = Scalar::new(0.0, 255.0, 0.0, 0.0);
    let bbox = detection.bbox;
    let rect = core::Rect::new(
        bbox.x1.round() as i32,
        bbox.y1.round() as i32,
        bbox.width().round().max(1.0) as i32,
        bbox.height().round().max(1.0) as i32,
    );
    imgproc::rectangle(frame, rect, green, 2, imgproc::LINE_8, 0)?;

    let label = format!(
        "{} {} ({:.2})",
        class_name(track.class_id),
        track.id,
        detection.confidence
    );
    imgproc::put_text(
        frame,
        &label,
        core::Point::new(rect.x, (rect.y - 10).max(12)),
        imgproc::FONT_HERSHEY_SIMPLEX,
        0.5,
        green,
        2,
        imgproc::LINE_8,
        false,
    )?;

    if track.history.len() > 1 {
        let trail: Vector<core::Point> = track
            .history
            .iter()
            .map(|p| core::Point::new(p.x.round() as i32, p.y.round() as i32))
            .collect();
        let yellow = Scalar::new(0.0, 255.0, 255.0, 0.0);
        imgproc::polylines(frame, &trail, false, yellow, 2, imgproc::LINE_AA, 0)?;
    }
    Ok(())
}

/// Per-day cap on saved frames, reset when the UTC date changes.
#[derive(Debug, Clone)]
pub struct DailyQuota {
    limit: u32,
    day: Option<NaiveDate>,
    used: u32,
}

impl DailyQuota {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            day: None,
            used: 0,
        }
    }

    pub fn try_take(&mut self, today: NaiveDate) -> bool {
        if self.day != Some(today) {
            self.day = Some(today);
            self.used = 0;
        }
        if self.used >= self.limit {
            return false;
        }
        self.used += 1;
        true
    }

    pub fn used(&self) -> u32 {
        self.used
    }
}
