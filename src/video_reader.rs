use crate::command::ControlCommand;
use crate::config::AppConfig;
use crate::detector::{Detector, DetectorError, YoloV8};
use crate::frame;
use eframe::egui;
use log::{debug, error, info, warn};
use opencv::{
    core::Mat,
    prelude::*,
    videoio::{self, VideoCapture},
};
use std::{
    path::Path,
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;

// Defines the error types.
#[derive(Debug, Clone, Error)]
pub enum VideoReaderError {
    #[error("Video error: {0}")]
    OpenCV(String),
    #[error("Detector error: {0}")]
    Detector(String),
    #[error("Invalid frame size {0}")]
    FrameSize(u32),
    #[error("Failed to start video reader thread: {0}")]
    Thread(String),
}

impl From<DetectorError> for VideoReaderError {
    fn from(err: DetectorError) -> Self {
        VideoReaderError::Detector(err.to_string())
    }
}

impl From<opencv::Error> for VideoReaderError {
    fn from(err: opencv::Error) -> Self {
        VideoReaderError::OpenCV(err.to_string())
    }
}

/// A frame after detection, ready to be shown.
#[derive(Clone)]
pub struct AnnotatedFrame {
    pub image: egui::ColorImage,
    /// 0-based position within the session.
    pub index: u64,
    pub detections: usize,
}

pub type FrameResult = Result<AnnotatedFrame, VideoReaderError>;

/// Sequential source of BGR frames.
pub trait FrameSource: Send {
    /// Returns `Ok(None)` once no further frame can be read.
    fn next_frame(&mut self) -> Result<Option<Mat>, VideoReaderError>;

    /// Frames per second reported by the source, or 0 when unknown.
    fn fps(&self) -> f64;
}

/// A struct responsible for opening a video and decoding it frame by frame.
/// This struct does not handle threading.
pub struct FrameDecoder {
    cap: VideoCapture,
}

impl FrameDecoder {
    /// Creates a new FrameDecoder by opening the specified video file.
    pub fn new(path: &Path) -> Result<Self, VideoReaderError> {
        let path_str = path.to_str().ok_or_else(|| {
            VideoReaderError::OpenCV(format!(
                "Failed to open video file: path is not valid UTF-8: {}",
                path.display()
            ))
        })?;
        let cap = VideoCapture::from_file(path_str, videoio::CAP_ANY)
            .map_err(|e| VideoReaderError::OpenCV(format!("Failed to open video file: {:?}", e)))?;

        // Check if the video capture was actually opened successfully.
        if !cap.is_opened().unwrap_or(false) {
            return Err(VideoReaderError::OpenCV(format!(
                "Failed to open video file: {}",
                path_str
            )));
        }

        Ok(Self { cap })
    }
}

impl FrameSource for FrameDecoder {
    /// Read errors are treated like the end of the stream.
    fn next_frame(&mut self) -> Result<Option<Mat>, VideoReaderError> {
        let mut frame = Mat::default();
        match self.cap.read(&mut frame) {
            Ok(true) if !frame.empty() => Ok(Some(frame)),
            Ok(_) => Ok(None),
            Err(e) => {
                debug!("Frame read failed, ending stream: {}", e);
                Ok(None)
            }
        }
    }

    fn fps(&self) -> f64 {
        self.cap.get(videoio::CAP_PROP_FPS).unwrap_or(0.0)
    }
}

/// How the background loop treats each frame.
#[derive(Clone)]
pub struct WorkerSettings {
    /// Side of the square frames are resized to.
    pub frame_size: i32,
    pub throttle_to_source_fps: bool,
    /// Woken after every published frame.
    pub repaint: Option<egui::Context>,
}

impl WorkerSettings {
    pub fn from_config(
        config: &AppConfig,
        repaint: Option<egui::Context>,
    ) -> Result<Self, VideoReaderError> {
        let frame_size = i32::try_from(config.input_size)
            .ok()
            .filter(|size| *size > 0)
            .ok_or(VideoReaderError::FrameSize(config.input_size))?;
        Ok(Self {
            frame_size,
            throttle_to_source_fps: config.throttle_to_source_fps,
            repaint,
        })
    }
}

/// One playback session: a background thread decoding, detecting and
/// publishing frames. Stopping (or dropping) it joins the thread.
pub struct VideoReader {
    control_sender: mpsc::Sender<ControlCommand>,
    thread_handle: Option<thread::JoinHandle<()>>,
}

impl VideoReader {
    /// Opens `path` and starts a session with the YOLOv8 detector from `config`.
    ///
    /// The video is opened on the calling thread so a bad file is reported
    /// right away. The model is loaded on the worker thread; a failure there
    /// arrives as an `Err` on `image_sender`.
    pub fn open(
        path: &Path,
        config: &AppConfig,
        image_sender: mpsc::Sender<FrameResult>,
        repaint: Option<egui::Context>,
    ) -> Result<Self, VideoReaderError> {
        let settings = WorkerSettings::from_config(config, repaint)?;
        let decoder = FrameDecoder::new(path)?;
        info!("Opened video {}", path.display());

        let detector_config = config.clone();
        Self::spawn(
            decoder,
            move || YoloV8::from_config(&detector_config),
            settings,
            image_sender,
        )
    }

    /// Starts the background loop over `source`.
    ///
    /// `make_detector` runs on the worker thread before the first frame.
    pub fn spawn<S, F, D>(
        source: S,
        make_detector: F,
        settings: WorkerSettings,
        image_sender: mpsc::Sender<FrameResult>,
    ) -> Result<Self, VideoReaderError>
    where
        S: FrameSource + 'static,
        F: FnOnce() -> Result<D, DetectorError> + Send + 'static,
        D: Detector + 'static,
    {
        let (control_sender, control_receiver) = mpsc::channel();
        let thread_handle = thread::Builder::new()
            .name("video-reader".to_string())
            .spawn(move || {
                let detector = match make_detector() {
                    Ok(detector) => detector,
                    Err(err) => {
                        error!("Failed to create detector: {}", err);
                        let _ = image_sender.send(Err(err.into()));
                        return;
                    }
                };
                run_session(source, detector, settings, image_sender, control_receiver);
            })
            .map_err(|e| VideoReaderError::Thread(e.to_string()))?;

        Ok(Self {
            control_sender,
            thread_handle: Some(thread_handle),
        })
    }

    pub fn pause(&self) {
        let _ = self.control_sender.send(ControlCommand::Pause);
    }

    pub fn resume(&self) {
        let _ = self.control_sender.send(ControlCommand::Resume);
    }

    /// Asks the loop to stop and blocks until its thread has exited.
    pub fn stop(mut self) {
        self.shutdown();
    }

    pub fn is_finished(&self) -> bool {
        self.thread_handle
            .as_ref()
            .is_none_or(|handle| handle.is_finished())
    }

    fn shutdown(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            info!("Stopping video reader");
            // The loop may already have ended on its own, so a closed channel is fine.
            let _ = self.control_sender.send(ControlCommand::Stop);
            if handle.join().is_err() {
                error!("Video reader thread panicked");
            }
        }
    }
}

impl Drop for VideoReader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_session<S: FrameSource, D: Detector>(
    mut source: S,
    mut detector: D,
    settings: WorkerSettings,
    image_sender: mpsc::Sender<FrameResult>,
    control_receiver: mpsc::Receiver<ControlCommand>,
) {
    let frame_interval = frame_interval(settings.throttle_to_source_fps, source.fps());
    let mut is_paused = false;
    let mut index: u64 = 0;

    loop {
        // Check for control commands from the UI thread. While paused, wait for one.
        let command = if is_paused {
            match control_receiver.recv() {
                Ok(command) => Some(command),
                Err(_) => break,
            }
        } else {
            match control_receiver.try_recv() {
                Ok(command) => Some(command),
                Err(mpsc::TryRecvError::Empty) => None,
                // UI thread has disconnected, terminate.
                Err(mpsc::TryRecvError::Disconnected) => break,
            }
        };
        match command {
            Some(ControlCommand::Stop) => {
                debug!("Stop requested");
                break;
            }
            Some(ControlCommand::Pause) => is_paused = true,
            Some(ControlCommand::Resume) => is_paused = false,
            None => {}
        }
        if is_paused {
            continue;
        }

        let started = Instant::now();
        let raw = match source.next_frame() {
            Ok(Some(raw)) => raw,
            // End of video.
            Ok(None) => break,
            Err(err) => {
                let _ = image_sender.send(Err(err));
                break;
            }
        };

        let annotated = match process_frame(&raw, &mut detector, settings.frame_size, index) {
            Ok(annotated) => annotated,
            Err(err) => {
                warn!("Frame {} failed: {}", index, err);
                let _ = image_sender.send(Err(err));
                break;
            }
        };
        if image_sender.send(Ok(annotated)).is_err() {
            // Nobody is listening anymore.
            break;
        }
        if let Some(ctx) = &settings.repaint {
            ctx.request_repaint();
        }
        index += 1;

        if let Some(interval) = frame_interval {
            if let Some(remaining) = interval.checked_sub(started.elapsed()) {
                thread::sleep(remaining);
            }
        }
    }

    info!("Video session finished after {} frames", index);
}

/// Time budget per frame when pacing to the source, `None` when not pacing.
fn frame_interval(throttle: bool, fps: f64) -> Option<Duration> {
    (throttle && fps.is_finite() && fps > 0.0).then(|| Duration::from_secs_f64(1.0 / fps))
}

fn process_frame<D: Detector>(
    raw: &Mat,
    detector: &mut D,
    frame_size: i32,
    index: u64,
) -> Result<AnnotatedFrame, VideoReaderError> {
    let mut square = frame::resize_square(raw, frame_size)?;
    let detections = detector.annotate(&mut square)?;
    let image = frame::to_color_image(&square)?;
    Ok(AnnotatedFrame {
        image,
        index,
        detections: detections.len(),
    })
}
