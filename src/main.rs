mod command;
mod config;
mod detector;
mod frame;
mod ui;
mod video_reader;

use config::AppConfig;
use eframe::egui;
use ui::PlayerApp;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AppConfig::load();
    log::info!(
        "Using model {} (conf {}, iou {})",
        config.model_path.display(),
        config.conf_threshold,
        config.iou_threshold
    );

    let mut viewport = egui::ViewportBuilder::default()
        .with_title("Yolov8s Demo")
        .with_inner_size(ui::window_inner_size(config.input_size));
    if config.always_on_top {
        viewport = viewport.with_always_on_top();
    }
    let options = eframe::NativeOptions {
        viewport,
        ..Default::default()
    };

    eframe::run_native(
        "Yolov8s Demo",
        options,
        Box::new(move |_cc| Ok(Box::new(PlayerApp::new(config)))),
    )
    .map_err(|e| anyhow::anyhow!("Failed to run app: {}", e))?;

    Ok(())
}
