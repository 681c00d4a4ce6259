use eframe::egui;
use opencv::{
    core::{self, Mat, Size},
    imgproc,
    prelude::*,
};

/// Resizes a frame to a `side` x `side` square, ignoring the aspect ratio.
pub fn resize_square(frame: &Mat, side: i32) -> opencv::Result<Mat> {
    let size = frame.size()?;
    if size.width == side && size.height == side {
        return frame.try_clone();
    }
    let mut resized = Mat::default();
    imgproc::resize(
        frame,
        &mut resized,
        Size::new(side, side),
        0.0,
        0.0,
        imgproc::INTER_LINEAR,
    )?;
    Ok(resized)
}

/// Converts a BGR frame into an RGB `ColorImage` of the same size.
pub fn to_color_image(bgr: &Mat) -> opencv::Result<egui::ColorImage> {
    let mut rgb = Mat::default();
    imgproc::cvt_color(
        bgr,
        &mut rgb,
        imgproc::COLOR_BGR2RGB,
        0,
        core::AlgorithmHint::ALGO_HINT_DEFAULT,
    )?;

    let size = rgb.size()?;
    let data = rgb.data_bytes()?;
    Ok(egui::ColorImage::from_rgb(
        [size.width as usize, size.height as usize],
        data,
    ))
}

#[cfg(test)]
pub(crate) fn solid_frame(width: i32, height: i32, bgr: (f64, f64, f64)) -> Mat {
    Mat::new_rows_cols_with_default(
        height,
        width,
        core::CV_8UC3,
        core::Scalar::new(bgr.0, bgr.1, bgr.2, 0.0),
    )
    .expect("Failed to allocate test frame")
}
