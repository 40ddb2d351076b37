//! Page image → base64 PNG attachment for a vision request.
//!
//! PNG keeps rendered glyph edges intact; JPEG artefacts around small text
//! measurably hurt transcription. `detail: "high"` asks OpenAI-style APIs to
//! tile the full image instead of a single low-resolution overview.

use crate::error::ModelError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use tracing::debug;

pub fn encode_page(img: &DynamicImage) -> Result<ImageData, ModelError> {
    let mut png = Vec::new();
    img.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|e| ModelError::Service(format!("PNG encoding failed: {e}")))?;

    let b64 = STANDARD.encode(&png);
    debug!(
        "Encoded {}x{} page → {} bytes base64",
        img.width(),
        img.height(),
        b64.len()
    );
    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}
