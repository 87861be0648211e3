use factory_sentinel::core_modules::frame_source::FrameSource;
use factory_sentinel::error::FrameError;
use image::{DynamicImage, RgbImage};
use opencv::{
    core::Mat,
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture},
};
use tracing::debug;

/// Frames from a video file or a capture device. A file rewinds to its first
/// frame when it runs out.
pub struct VideoSource {
    cap: VideoCapture,
    frame: Mat,
    rewinds_left: u8,
}

impl VideoSource {
    /// `source` is a file path, or a device index such as `0` for a webcam.
    pub fn open(source: &str) -> Result<Self, FrameError> {
        let cap = match source.parse::<i32>() {
            Ok(index) => VideoCapture::new(index, videoio::CAP_ANY),
            Err(_) => VideoCapture::from_file(source, videoio::CAP_ANY),
        }
        .map_err(device)?;
        if !cap.is_opened().map_err(device)? {
            return Err(FrameError::Device(format!("could not open video source {source}")));
        }
        Ok(Self {
            cap,
            frame: Mat::default(),
            rewinds_left: 1,
        })
    }

    fn to_image(&self) -> Result<DynamicImage, FrameError> {
        let mut rgb = Mat::default();
        imgproc::cvt_color(&self.frame, &mut rgb, imgproc::COLOR_BGR2RGB, 0).map_err(device)?;
        let width = rgb.cols() as u32;
        let height = rgb.rows() as u32;
        let pixels = rgb.data_bytes().map_err(device)?.to_vec();
        RgbImage::from_raw(width, height, pixels)
            .map(DynamicImage::ImageRgb8)
            .ok_or_else(|| FrameError::Device(format!("{width}x{height} frame buffer size mismatch")))
    }
}

impl FrameSource for VideoSource {
    fn next_frame(&mut self) -> Result<DynamicImage, FrameError> {
        loop {
            let read = self.cap.read(&mut self.frame).map_err(device)?;
            if read && !self.frame.empty() {
                self.rewinds_left = 1;
                return self.to_image();
            }
            // End of file. A source that yields nothing even after a rewind is dead.
            if self.rewinds_left == 0 {
                return Err(FrameError::Empty);
            }
            self.rewinds_left -= 1;
            debug!("end of video, rewinding");
            self.cap.set(videoio::CAP_PROP_POS_FRAMES, 0.0).map_err(device)?;
        }
    }
}

fn device(e: opencv::Error) -> FrameError {
    FrameError::Device(e.to_string())
}
