pub mod image_helper {
    use image::{ExtendedColorType, GrayImage, ImageEncoder, RgbImage};
    use std::path::Path;

    /// Encodes a raw buffer as PNG, creating parent directories as needed.
    pub fn save(
        path: &Path,
        width: u32,
        height: u32,
        buffer: &[u8],
        color: ExtendedColorType,
    ) -> Result<(), image::error::ImageError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let output = std::io::BufWriter::new(std::fs::File::create(path)?);
        let encoder = image::codecs::png::PngEncoder::new(output);

        encoder.write_image(buffer, width, height, color)?;

        Ok(())
    }

    /// Raw capture of the radar region.
    pub fn save_capture(path: &Path, image: &RgbImage) -> Result<(), image::error::ImageError> {
        save(path, image.width(), image.height(), image.as_raw(), ExtendedColorType::Rgb8)
    }

    /// Binary mask, foreground white.
    pub fn save_mask(path: &Path, mask: &GrayImage) -> Result<(), image::error::ImageError> {
        save(path, mask.width(), mask.height(), mask.as_raw(), ExtendedColorType::L8)
    }
}
