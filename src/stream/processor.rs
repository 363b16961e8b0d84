use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use opencv::core::{Mat, Size};
use opencv::imgproc;
use opencv::prelude::*;

use crate::alerts::AlertEvaluator;
use crate::analytics::{DetectParams, SharedModel};
use crate::camera::{CaptureError, FrameSource};
use crate::config::StreamConfig;
use crate::storage::{DailyQuota, DetectionEvent, EventSink, FrameWriter};
use crate::tracking::CentroidTracker;

use super::{StatusHandle, StreamError, StreamState};

pub const MISSED_FRAME_DELAY: Duration = Duration::from_secs(1);

const SLEEP_SLICE: Duration = Duration::from_millis(100);

pub trait Sleeper: Send {
    /// Waits up to `duration`, returning early once `interrupted` reports true.
    fn pause(&mut self, duration: Duration, interrupted: &dyn Fn() -> bool);
}

pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn pause(&mut self, duration: Duration, interrupted: &dyn Fn() -> bool) {
        let deadline = Instant::now() + duration;
        loop {
            if interrupted() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

pub struct StreamProcessor {
    config: StreamConfig,
    params: DetectParams,
    status: StatusHandle,
    source: Box<dyn FrameSource>,
    model: SharedModel,
    tracker: CentroidTracker,
    alerts: AlertEvaluator,
    sink: Arc<dyn EventSink>,
    frames: Option<FrameWriter>,
    quota: DailyQuota,
    sleeper: Box<dyn Sleeper>,
    shutdown: Arc<AtomicBool>,
    frame_count: u64,
    reconnects: u32,
    missed_reads: u32,
}

impl StreamProcessor {
    pub fn new(
        config: StreamConfig,
        status: StatusHandle,
        source: Box<dyn FrameSource>,
        model: SharedModel,
        sink: Arc<dyn EventSink>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let frames = if config.save.save_frames || config.save.save_all_frames {
            Some(FrameWriter::new(&config.id, &config.output_dir(), &config.save))
        } else {
            None
        };

        Self {
            params: config.detect_params(),
            tracker: CentroidTracker::new(&config.tracking),
            alerts: AlertEvaluator::new(&config.id, &config.alerts),
            quota: DailyQuota::new(config.save.max_frames_per_day),
            frames,
            config,
            status,
            source,
            model,
            sink,
            sleeper: Box::new(ThreadSleeper),
            shutdown,
            frame_count: 0,
            reconnects: 0,
            missed_reads: 0,
        }
    }

    #[cfg(test)]
    pub fn with_sleeper(mut self, sleeper: Box<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn run(mut self) -> StreamState {
        tracing::info!(stream = %self.config.id, model = %self.model.name(), "stream processor started");

        let outcome = self.run_loop();
        self.source.release();

        match outcome {
            Ok(()) => self.finish_stopped(),
            Err(e) => {
                if self.status.fail(&e.to_string()) {
                    tracing::error!(stream = %self.config.id, error = %e, reconnects = self.reconnects, "stream failed");
                } else {
                    // A stop landed while the last attempt was blocked.
                    tracing::info!(stream = %self.config.id, error = %e, "stream failed after stop request");
                    self.finish_stopped();
                }
            }
        }

        let state = self.status.state();
        tracing::info!(stream = %self.config.id, state = %state, frames = self.frame_count, "stream processor exited");
        state
    }

    fn run_loop(&mut self) -> Result<(), StreamError> {
        if !self.connect()? {
            return Ok(());
        }
        if !self.status.transition(StreamState::Running) {
            return Ok(());
        }

        loop {
            if self.should_stop() {
                return Ok(());
            }

            match self.source.read() {
                Ok(Some(frame)) => {
                    self.missed_reads = 0;
                    if self.process_frame(&frame) {
                        self.pause(self.config.frame_interval());
                    }
                }
                Ok(None) => {
                    self.missed_reads += 1;
                    let limit = self.config.rtsp.max_missed_reads;
                    if limit > 0 && self.missed_reads >= limit {
                        let stalled = CaptureError::Stalled(self.missed_reads);
                        self.missed_reads = 0;
                        if !self.recover(stalled)? {
                            return Ok(());
                        }
                        continue;
                    }
                    tracing::trace!(stream = %self.config.id, error = %StreamError::TransientRead, "retrying");
                    self.pause(MISSED_FRAME_DELAY);
                }
                Err(e) => {
                    if !self.recover(e)? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// `Ok(false)` means a stop was requested before the source opened.
    fn connect(&mut self) -> Result<bool, StreamError> {
        loop {
            if self.should_stop() {
                return Ok(false);
            }
            match self.source.open() {
                Ok(()) => {
                    tracing::info!(stream = %self.config.id, "stream connected");
                    return Ok(true);
                }
                Err(e) => self.spend_attempt(e)?,
            }
        }
    }

    fn recover(&mut self, lost: CaptureError) -> Result<bool, StreamError> {
        tracing::warn!(stream = %self.config.id, error = %lost, "capture lost");
        self.source.release();
        self.spend_attempt(lost)?;
        self.connect()
    }

    fn spend_attempt(&mut self, cause: CaptureError) -> Result<(), StreamError> {
        self.reconnects += 1;
        let reconnects = self.reconnects;
        self.status.update(|s| s.metrics.reconnects = reconnects);
        if self.should_stop() {
            return Ok(());
        }

        let max = self.config.rtsp.reconnect_attempts;
        if reconnects >= max {
            return Err(StreamError::Connection(cause));
        }

        let delay = self.config.rtsp.reconnect_delay();
        tracing::warn!(
            stream = %self.config.id,
            attempt = reconnects,
            max,
            delay_secs = delay.as_secs(),
            error = %cause,
            "reconnecting"
        );
        self.pause(delay);
        Ok(())
    }

    /// Returns false when decimation skipped the frame.
    fn process_frame(&mut self, frame: &Mat) -> bool {
        self.frame_count += 1;
        self.status.update(|s| s.metrics.frames_read += 1);

        if self.frame_count % u64::from(self.config.process_every_n_frames) != 0 {
            return false;
        }

        let started = Instant::now();

        let resized = match fit_width(frame, self.config.image_size) {
            Ok(resized) => resized,
            Err(e) => {
                tracing::warn!(stream = %self.config.id, error = %e, "resize failed, frame skipped");
                return true;
            }
        };
        let frame = resized.as_ref().unwrap_or(frame);

        let detections = match self.model.detect(frame, &self.params) {
            Ok(detections) => detections,
            Err(e) => {
                let e = StreamError::from(e);
                tracing::warn!(stream = %self.config.id, error = %e, "frame skipped");
                return true;
            }
        };

        let assignments = self.tracker.update(&detections);
        let now = Utc::now();
        let mut emitted = 0;

        for assignment in assignments.iter().filter(|a| a.newly_confirmed) {
            let Some(track) = self.tracker.track(assignment.track_id) else {
                continue;
            };

            let mut saved_frame = None;
            if self.config.save.save_frames {
                if let Some(writer) = &self.frames {
                    if self.quota.try_take(now.date_naive()) {
                        match writer.save_detection(frame, track, &assignment.detection, now) {
                            Ok(path) => saved_frame = Some(path),
                            Err(e) => {
                                let e = StreamError::from(e);
                                tracing::warn!(stream = %self.config.id, track = track.id, error = %e, "failed to save frame");
                            }
                        }
                    }
                }
            }

            let event = DetectionEvent::from_track(&self.config.id, track, &assignment.detection, saved_frame, now);
            let class = event.class_name.clone();
            tracing::info!(
                stream = %self.config.id,
                track = event.track_id,
                class = %class,
                confidence = event.confidence,
                "object confirmed"
            );

            if let Err(e) = self.sink.publish(event) {
                let e = StreamError::from(e);
                tracing::warn!(stream = %self.config.id, error = %e, "failed to publish detection");
            }

            self.status.update(|s| {
                *s.detections.entry(class).or_insert(0) += 1;
                s.last_detection = Some(now);
            });
            emitted += 1;
        }

        if emitted == 0 && self.config.save.save_all_frames {
            if let Some(writer) = &self.frames {
                if self.quota.try_take(now.date_naive()) {
                    if let Err(e) = writer.save_frame(frame, now) {
                        let e = StreamError::from(e);
                        tracing::warn!(stream = %self.config.id, error = %e, "failed to save frame");
                    }
                }
            }
        }

        let raised = self.alerts.evaluate(&self.tracker, now);
        let alert_count = raised.len() as u64;
        for alert in raised {
            if let Err(e) = self.sink.publish_alert(alert) {
                let e = StreamError::from(e);
                tracing::warn!(stream = %self.config.id, error = %e, "failed to publish alert");
            }
        }

        let elapsed = started.elapsed();
        let active_tracks = self.tracker.len();
        tracing::debug!(
            stream = %self.config.id,
            frame = self.frame_count,
            tracks = active_tracks,
            confirmed = self.tracker.confirmed_count(),
            elapsed_ms = elapsed.as_millis() as u64,
            "frame processed"
        );
        let saved_today = self.quota.used();
        self.status.update(|s| {
            s.metrics.frames_processed += 1;
            s.metrics.processing_time_ms = elapsed.as_secs_f64() * 1000.0;
            if elapsed > Duration::ZERO {
                s.metrics.fps = 1.0 / elapsed.as_secs_f64();
            }
            s.metrics.daily_frames_saved = saved_today;
            s.active_tracks = active_tracks;
            s.alerts += alert_count;
        });
        true
    }

    fn finish_stopped(&self) {
        let state = self.status.state();
        if state.is_terminal() {
            return;
        }
        if state != StreamState::Stopping {
            self.status.transition(StreamState::Stopping);
        }
        self.status.transition(StreamState::Stopped);
    }

    fn should_stop(&self) -> bool {
        stop_signalled(&self.shutdown, &self.status)
    }

    fn pause(&mut self, duration: Duration) {
        let shutdown = &self.shutdown;
        let status = &self.status;
        self.sleeper
            .pause(duration, &|| stop_signalled(shutdown, status));
    }
}

fn stop_signalled(shutdown: &AtomicBool, status: &StatusHandle) -> bool {
    shutdown.load(Ordering::Relaxed) || status.stop_requested()
}

/// `None` when the frame already fits.
pub fn fit_width(frame: &Mat, max_width: u32) -> opencv::Result<Option<Mat>> {
    let cols = frame.cols();
    let max_width = max_width.min(i32::MAX as u32) as i32;
    if cols <= max_width || cols == 0 {
        return Ok(None);
    }

    let height = ((frame.rows() as f64) * (max_width as f64) / (cols as f64)).round() as i32;
    let mut resized = Mat::default();
    imgproc::resize(
        frame,
        &mut resized,
        Size::new(max_width, height.max(1)),
        0.0,
        0.0,
        imgproc::INTER_AREA,
    )?;
    Ok(Some(resized))
}
