use std::time::Duration;

use opencv::core::{Mat, Vector};
use opencv::prelude::*;
use opencv::videoio::{self, VideoCapture};
use thiserror::Error;

use crate::config::StreamConfig;

const FFMPEG_CAPTURE_OPTIONS: &str = "OPENCV_FFMPEG_CAPTURE_OPTIONS";

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("opencv error: {0}")]
    OpenCv(#[from] opencv::Error),
    #[error("failed to open stream {0}")]
    OpenFailed(String),
    #[error("capture is not open")]
    NotOpen,
    #[error("no frame after {0} consecutive reads")]
    Stalled(u32),
}

pub trait FrameSource: Send {
    fn open(&mut self) -> Result<(), CaptureError>;

    /// `Ok(None)` is a missed read; the capture is still usable.
    fn read(&mut self) -> Result<Option<Mat>, CaptureError>;

    fn release(&mut self);
}

pub trait SourceFactory: Send + Sync {
    fn create(&self, config: &StreamConfig) -> Box<dyn FrameSource>;
}

/// Must run before any capture thread is spawned.
pub fn configure_ffmpeg_transport() {
    if std::env::var_os(FFMPEG_CAPTURE_OPTIONS).is_none() {
        std::env::set_var(FFMPEG_CAPTURE_OPTIONS, "rtsp_transport;tcp");
    }
}

pub struct RtspCapture {
    stream_id: String,
    url: String,
    timeout: Duration,
    capture: Option<VideoCapture>,
}

impl RtspCapture {
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            stream_id: config.id.clone(),
            url: config.url.clone(),
            timeout: config.rtsp.timeout(),
            capture: None,
        }
    }
}

impl FrameSource for RtspCapture {
    fn open(&mut self) -> Result<(), CaptureError> {
        self.release();

        let timeout_ms = self.timeout.as_millis().min(i32::MAX as u128) as i32;
        let params = Vector::<i32>::from_slice(&[
            videoio::CAP_PROP_OPEN_TIMEOUT_MSEC,
            timeout_ms,
            videoio::CAP_PROP_READ_TIMEOUT_MSEC,
            timeout_ms,
        ]);

        let capture = VideoCapture::from_file_with_params(&self.url, videoio::CAP_FFMPEG, &params)?;
        if !capture.is_opened()? {
            return Err(CaptureError::OpenFailed(self.url.clone()));
        }

        tracing::debug!(stream = %self.stream_id, "capture opened");
        self.capture = Some(capture);
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Mat>, CaptureError> {
        let capture = self.capture.as_mut().ok_or(CaptureError::NotOpen)?;

        let mut frame = Mat::default();
        if !capture.read(&mut frame)? || frame.empty() {
            return Ok(None);
        }
        Ok(Some(frame))
    }

    fn release(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            if let Err(e) = capture.release() {
                tracing::warn!(stream = %self.stream_id, error = %e, "failed to release capture");
            }
        }
    }
}

impl Drop for RtspCapture {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct RtspSourceFactory;

impl SourceFactory for RtspSourceFactory {
    fn create(&self, config: &StreamConfig) -> Box<dyn FrameSource> {
        Box::new(RtspCapture::new(config))
    }
}
