use image::{imageops::FilterType, DynamicImage, ImageFormat, RgbImage};
use ndarray::{Array, Array4};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("Empty upload")]
    Empty,
    #[error("Upload is not a recognized image")]
    Unrecognized,
    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),
    #[error("Error decoding image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("Image has zero width or height")]
    ZeroSized,
}

const ACCEPTED_FORMATS: [ImageFormat; 2] = [ImageFormat::Png, ImageFormat::Jpeg];

/// Decodes an uploaded PNG or JPEG into a three-channel image.
pub fn decode_upload(image_data: &[u8]) -> Result<RgbImage, PreprocessError> {
    if image_data.is_empty() {
        return Err(PreprocessError::Empty);
    }

    let format = image::guess_format(image_data)
        .map_err(|_| PreprocessError::Unrecognized)?;
    if !ACCEPTED_FORMATS.contains(&format) {
        return Err(PreprocessError::UnsupportedFormat(format!("{:?}", format)));
    }

    let decoded = image::load_from_memory_with_format(image_data, format)?;
    Ok(decoded.to_rgb8())
}

/// Stretches the image to `size x size` and lays it out as a `[1, 3, size, size]`
/// tensor with RGB channels scaled to `[0, 1]`.
pub fn image_to_tensor(image: &DynamicImage, size: u32) -> Result<Array4<f32>, PreprocessError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(PreprocessError::ZeroSized);
    }

    let resized = image
        .resize_exact(size, size, FilterType::CatmullRom)
        .to_rgb8();

    let side = size as usize;
    let mut input = Array::zeros((1, 3, side, side));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        let [r, g, b] = pixel.0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }

    Ok(input)
}
