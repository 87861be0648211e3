pub mod image_helper {
    use image::codecs::jpeg::JpegEncoder;
    use image::imageops::FilterType;
    use image::{DynamicImage, ImageEncoder};

    /// Resizes a frame to exactly `width`x`height` and encodes it as JPEG.
    ///
    /// The aspect ratio is not preserved; the classifier and the viewer both
    /// expect the fixed analysis size.
    pub fn encode_analysis_jpeg(
        frame: &DynamicImage,
        width: u32,
        height: u32,
        quality: u8,
    ) -> Result<Vec<u8>, image::error::ImageError> {
        let resized = if frame.width() == width && frame.height() == height {
            frame.to_rgb8()
        } else {
            frame.resize_exact(width, height, FilterType::Triangle).to_rgb8()
        };

        let mut buffer = Vec::with_capacity((width * height / 4) as usize);
        let encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
        encoder.write_image(
            resized.as_raw(),
            width,
            height,
            image::ExtendedColorType::Rgb8,
        )?;

        Ok(buffer)
    }
}
