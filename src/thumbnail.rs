use image::{imageops::FilterType, GenericImageView, ImageFormat, ImageReader};
use std::io::Cursor;

use crate::error::Result;
use crate::image_asset::ThumbSize;

pub const THUMBNAIL_CONTENT_TYPE: &str = "image/png";

pub struct RenderedThumbnail {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Scales the image down so it fits in `target`, keeping the aspect ratio,
/// and encodes it as PNG. Never scales up.
pub fn render_thumbnail(source: &[u8], target: ThumbSize) -> Result<RenderedThumbnail> {
    let image = image::load_from_memory(source)?;
    let (width, height) = image.dimensions();

    let image = if width > target.width || height > target.height {
        // catmull-rom is the bicubic filter
        image.resize(target.width, target.height, FilterType::CatmullRom)
    } else {
        image
    };

    let mut data = Vec::new();
    image.write_to(&mut Cursor::new(&mut data), ImageFormat::Png)?;
    Ok(RenderedThumbnail {
        data,
        width: image.width(),
        height: image.height(),
    })
}

/// Reads only the header to get the pixel size of an uploaded image.
pub fn probe_dimensions(data: &[u8]) -> Result<(u32, u32)> {
    let reader = ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(image::ImageError::IoError)?;
    Ok(reader.into_dimensions()?)
}
