//! QR payload rendering for the admin UI.

use std::io::Cursor;

use base64::Engine;
use image::{ImageFormat, Luma};
use qrcode::QrCode;

#[derive(Debug, thiserror::Error)]
pub enum QrError {
    #[error("QR encode error: {0}")]
    Encode(#[from] qrcode::types::QrError),

    #[error("PNG encode error: {0}")]
    Png(#[from] image::ImageError),
}

/// Render a raw QR payload into a `data:image/png;base64,...` URL
/// suitable for direct embedding in an `<img>` tag.
pub fn render_data_url(payload: &str) -> Result<String, QrError> {
    let code = QrCode::new(payload.as_bytes())?;
    let image = code
        .render::<Luma<u8>>()
        .min_dimensions(256, 256)
        .build();

    let mut png = Vec::new();
    image.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;

    let b64 = base64::engine::general_purpose::STANDARD.encode(&png);
    Ok(format!("data:image/png;base64,{b64}"))
}
