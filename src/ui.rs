use crate::config::AppConfig;
use crate::video_reader::{AnnotatedFrame, FrameResult, VideoReader};
use eframe::egui;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

/// Extensions offered by the file dialog.
pub const VIDEO_EXTENSIONS: [&str; 3] = ["mp4", "avi", "mkv"];

// Space around the frame for the panel margins, the button row and the status line.
const CHROME_WIDTH: f32 = 20.0;
const CHROME_HEIGHT: f32 = 80.0;

/// Initial window inner size that shows a `frame_side` square frame uncropped.
pub fn window_inner_size(frame_side: u32) -> [f32; 2] {
    let side = frame_side as f32;
    [side + CHROME_WIDTH, side + CHROME_HEIGHT]
}

// Enum to manage the playback state.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackState {
    // Initial state where no video is loaded.
    NotLoaded,
    Playing,
    Paused,
    // Stopped by the user; the last frame stays on screen.
    Stopped,
    // Playback has finished.
    Finished,
    // An error has occurred.
    Error(String),
}

pub struct PlayerApp {
    config: AppConfig,
    // The active session, if any. At most one exists at a time.
    video_reader: Option<VideoReader>,
    // Receiver for the active session's frames.
    image_receiver: Option<mpsc::Receiver<FrameResult>>,
    // Texture to display on the screen.
    texture: Option<egui::TextureHandle>,
    playback_state: PlaybackState,
    // (frame index, detection count) of the frame on screen.
    last_frame: Option<(u64, usize)>,
    frames_shown: u64,
}

impl PlayerApp {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            video_reader: None,
            image_receiver: None,
            texture: None,
            playback_state: PlaybackState::NotLoaded,
            last_frame: None,
            frames_shown: 0,
        }
    }

    pub fn playback_state(&self) -> &PlaybackState {
        &self.playback_state
    }

    /// Starts a session for the chosen file. `None` means the dialog was
    /// cancelled and nothing changes.
    pub fn open_video(&mut self, path: Option<PathBuf>, ctx: &egui::Context) {
        let Some(path) = path else {
            log::debug!("No video selected");
            return;
        };

        // Only one session at a time: finish the previous one first.
        self.stop();

        let (image_sender, image_receiver) = mpsc::channel();
        match VideoReader::open(&path, &self.config, image_sender, Some(ctx.clone())) {
            Ok(reader) => self.attach(reader, image_receiver),
            Err(err) => {
                log::error!("Failed to open {}: {}", path.display(), err);
                self.playback_state = PlaybackState::Error(err.to_string());
            }
        }
    }

    /// Makes `reader` the active session, stopping any previous one.
    fn attach(&mut self, reader: VideoReader, image_receiver: mpsc::Receiver<FrameResult>) {
        self.stop();
        self.video_reader = Some(reader);
        self.image_receiver = Some(image_receiver);
        self.last_frame = None;
        self.playback_state = PlaybackState::Playing;
    }

    /// Stops the active session and waits for its thread. No-op when idle.
    pub fn stop(&mut self) {
        if let Some(reader) = self.video_reader.take() {
            reader.stop();
            self.image_receiver = None;
            if matches!(
                self.playback_state,
                PlaybackState::Playing | PlaybackState::Paused
            ) {
                self.playback_state = PlaybackState::Stopped;
            }
        }
    }

    pub fn toggle_pause(&mut self) {
        let Some(reader) = &self.video_reader else {
            return;
        };
        match self.playback_state {
            PlaybackState::Playing => {
                reader.pause();
                self.playback_state = PlaybackState::Paused;
            }
            PlaybackState::Paused => {
                reader.resume();
                self.playback_state = PlaybackState::Playing;
            }
            _ => {}
        }
    }

    /// Applies every event the active session has published so far.
    pub fn poll_events(&mut self, ctx: &egui::Context) {
        let Some(image_receiver) = self.image_receiver.take() else {
            return;
        };

        let mut session_over = false;
        loop {
            match image_receiver.try_recv() {
                // Received new image data.
                Ok(Ok(frame)) => self.show_frame(ctx, frame),
                // An error occurred during video processing.
                Ok(Err(err)) => {
                    log::error!("Video processing error: {}", err);
                    self.playback_state =
                        PlaybackState::Error(format!("Video processing error: {}", err));
                    session_over = true;
                    break;
                }
                // Channel disconnected (video playback finished).
                Err(mpsc::TryRecvError::Disconnected) => {
                    if matches!(
                        self.playback_state,
                        PlaybackState::Playing | PlaybackState::Paused
                    ) {
                        self.playback_state = PlaybackState::Finished;
                    }
                    session_over = true;
                    break;
                }
                // No new data has arrived yet.
                Err(mpsc::TryRecvError::Empty) => break,
            }
        }

        if session_over {
            if let Some(reader) = self.video_reader.take() {
                reader.stop();
            }
        } else {
            self.image_receiver = Some(image_receiver);
        }
    }

    fn show_frame(&mut self, ctx: &egui::Context, frame: AnnotatedFrame) {
        match &mut self.texture {
            Some(texture) => texture.set(frame.image, egui::TextureOptions::LINEAR),
            None => {
                self.texture = Some(ctx.load_texture(
                    "video_frame",
                    frame.image,
                    egui::TextureOptions::LINEAR,
                ));
            }
        }
        self.last_frame = Some((frame.index, frame.detections));
        self.frames_shown += 1;
    }

    fn session_active(&self) -> bool {
        self.video_reader.as_ref().is_some_and(|r| !r.is_finished())
            || self.image_receiver.is_some()
    }

    fn status_line(&self) -> String {
        let state = match &self.playback_state {
            PlaybackState::NotLoaded => return "Please choose a video file.".to_string(),
            PlaybackState::Error(msg) => return msg.clone(),
            PlaybackState::Playing => "Playing",
            PlaybackState::Paused => "Paused",
            PlaybackState::Stopped => "Stopped",
            PlaybackState::Finished => "Playback finished",
        };
        match self.last_frame {
            Some((index, detections)) => {
                format!("{} | frame {} | {} objects", state, index + 1, detections)
            }
            None => state.to_string(),
        }
    }
}

impl eframe::App for PlayerApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        // Check for new frames from the background thread.
        self.poll_events(ctx);

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.horizontal(|ui| {
                if ui.button("Choose video").clicked() {
                    let path = rfd::FileDialog::new()
                        .set_title("Open Video")
                        .add_filter("Video Files", &VIDEO_EXTENSIONS)
                        .pick_file();
                    self.open_video(path, ctx);
                }

                if ui.button("Stop").clicked() {
                    self.stop();
                }

                match self.playback_state {
                    PlaybackState::Playing => {
                        if ui.button("Pause").clicked() {
                            self.toggle_pause();
                        }
                    }
                    PlaybackState::Paused => {
                        if ui.button("Resume").clicked() {
                            self.toggle_pause();
                        }
                    }
                    _ => {}
                }
            });

            ui.separator();

            let status = self.status_line();
            if let PlaybackState::Error(_) = self.playback_state {
                ui.colored_label(egui::Color32::RED, status);
            } else {
                ui.label(status);
            }

            if let Some(texture) = &self.texture {
                ui.vertical_centered(|ui| {
                    ui.image((texture.id(), texture.size_vec2()));
                });
            }
        });

        // Frames also trigger a repaint from the worker; this covers end-of-stream.
        if self.session_active() {
            ctx.request_repaint_after(Duration::from_millis(50));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video_reader::tests::{FakeDetector, FakeSource, settings};
    use std::sync::atomic::Ordering;
    use std::time::Instant;

    fn spawn_fake(source: FakeSource, frame_size: i32) -> (VideoReader, mpsc::Receiver<FrameResult>) {
        let (tx, rx) = mpsc::channel();
        let reader = VideoReader::spawn(source, || Ok(FakeDetector), settings(frame_size), tx)
            .expect("Failed to spawn reader");
        (reader, rx)
    }

    /// Polls until the session reports it is over.
    fn poll_until_over(app: &mut PlayerApp, ctx: &egui::Context) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while app.image_receiver.is_some() {
            assert!(Instant::now() < deadline, "session did not finish in time");
            app.poll_events(ctx);
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_no_selection_leaves_display_unchanged() {
        let ctx = egui::Context::default();
        let mut app = PlayerApp::new(AppConfig::default());

        app.open_video(None, &ctx);

        assert_eq!(app.playback_state, PlaybackState::NotLoaded);
        assert!(app.texture.is_none());
        assert!(app.video_reader.is_none());
        assert_eq!(app.frames_shown, 0);
    }

    #[test]
    fn test_unreadable_file_shows_error() {
        let ctx = egui::Context::default();
        let mut app = PlayerApp::new(AppConfig::default());

        app.open_video(Some(PathBuf::from("non_existent_video_file.mp4")), &ctx);

        assert!(matches!(app.playback_state, PlaybackState::Error(_)));
        assert!(app.video_reader.is_none());
    }

    #[test]
    fn test_each_frame_updates_display_once() {
        let ctx = egui::Context::default();
        let mut app = PlayerApp::new(AppConfig::default());
        let (reader, rx) = spawn_fake(FakeSource::finite(4), 32);
        app.attach(reader, rx);

        poll_until_over(&mut app, &ctx);

        assert_eq!(app.frames_shown, 4);
        assert_eq!(app.playback_state, PlaybackState::Finished);
        assert_eq!(app.last_frame, Some((3, 1)));
        let texture = app.texture.as_ref().expect("a frame should be displayed");
        assert_eq!(texture.size(), [32, 32]);
        assert!(app.video_reader.is_none());
    }

    #[test]
    fn test_stop_ends_session_and_keeps_last_frame() {
        let ctx = egui::Context::default();
        let mut app = PlayerApp::new(AppConfig::default());
        let source = FakeSource::endless();
        let released = source.released.clone();
        let (reader, rx) = spawn_fake(source, 16);
        app.attach(reader, rx);

        let deadline = Instant::now() + Duration::from_secs(10);
        while app.frames_shown == 0 {
            assert!(Instant::now() < deadline, "no frame arrived");
            app.poll_events(&ctx);
        }
        app.stop();

        assert!(released.load(Ordering::SeqCst));
        assert_eq!(app.playback_state, PlaybackState::Stopped);
        assert!(app.texture.is_some());
        assert!(app.image_receiver.is_none());

        // Stopping again is a no-op.
        app.stop();
        assert_eq!(app.playback_state, PlaybackState::Stopped);
    }

    #[test]
    fn test_new_session_replaces_running_one() {
        let mut app = PlayerApp::new(AppConfig::default());
        let first = FakeSource::endless();
        let first_released = first.released.clone();
        let (reader, rx) = spawn_fake(first, 16);
        app.attach(reader, rx);

        let (reader, rx) = spawn_fake(FakeSource::finite(2), 16);
        app.attach(reader, rx);

        assert!(first_released.load(Ordering::SeqCst));
        assert_eq!(app.playback_state, PlaybackState::Playing);

        let ctx = egui::Context::default();
        poll_until_over(&mut app, &ctx);
        assert_eq!(app.last_frame, Some((1, 1)));
    }

    #[test]
    fn test_toggle_pause_switches_state() {
        let mut app = PlayerApp::new(AppConfig::default());
        let (reader, rx) = spawn_fake(FakeSource::endless(), 16);
        app.attach(reader, rx);

        app.toggle_pause();
        assert_eq!(app.playback_state, PlaybackState::Paused);
        app.toggle_pause();
        assert_eq!(app.playback_state, PlaybackState::Playing);
        app.stop();
    }

    #[test]
    fn test_window_fits_frame_and_controls() {
        assert_eq!(window_inner_size(640), [660.0, 720.0]);
        let [w, h] = window_inner_size(320);
        assert!(w >= 320.0 && h >= 320.0 + CHROME_HEIGHT);
    }

    #[test]
    fn test_status_line_reports_last_frame() {
        let mut app = PlayerApp::new(AppConfig::default());
        assert_eq!(app.status_line(), "Please choose a video file.");

        app.playback_state = PlaybackState::Playing;
        app.last_frame = Some((9, 3));
        assert_eq!(app.status_line(), "Playing | frame 10 | 3 objects");
    }
}
