//! Image encoding: `PageImage` → base64 PNG wrapped in `ImageData`.
//!
//! PNG is lossless, which keeps account numbers and small-print amounts
//! crisp. `detail: "high"` asks GPT-4-class models for the full tile budget;
//! at "low" a bill's line items collapse into one 512 px overview tile.

use crate::model::PageImage;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::debug;

/// PNG bytes of a rendered page.
pub fn png_bytes(page: &PageImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    page.image
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}

/// Encode a rendered page as a base64 PNG ready for the VLM API.
pub fn encode_page(page: &PageImage) -> Result<ImageData, image::ImageError> {
    let b64 = STANDARD.encode(png_bytes(page)?);
    debug!(
        "Encoded page {} → {} bytes base64",
        page.page_index + 1,
        b64.len()
    );
    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

/// Write pages as `<dir>/<document_id>_<stem>_p<N>.png` for manual review.
pub fn save_pages(
    dir: &Path,
    document_id: i64,
    stem: &str,
    pages: &[PageImage],
) -> std::io::Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)?;
    let mut written = Vec::with_capacity(pages.len());
    for page in pages {
        let path = dir.join(format!("{}_{}_p{}.png", document_id, stem, page.page_index + 1));
        let bytes = png_bytes(page).map_err(std::io::Error::other)?;
        std::fs::write(&path, bytes)?;
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgba, RgbaImage};

    fn page(idx: usize) -> PageImage {
        PageImage::new(
            idx,
            DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255]))),
        )
    }

    #[test]
    fn encode_small_image() {
        let data = encode_page(&page(0)).expect("encode should succeed");
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        assert!(decoded.starts_with(b"\x89PNG"));
    }

    #[test]
    fn save_pages_names_by_document_and_page() {
        let tmp = tempfile::TempDir::new().unwrap();
        let written = save_pages(tmp.path(), 7, "bill", &[page(0), page(1)]).unwrap();
        assert_eq!(written.len(), 2);
        assert!(written[1].ends_with("7_bill_p2.png"));
        assert!(written[1].exists());
    }
}
