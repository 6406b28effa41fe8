//! Per-document pipeline stages.
//!
//! Each submodule implements exactly one transformation step, so each can be
//! tested alone and the runner can swap the renderer or the extractor for a
//! fake.
//!
//! ## Data Flow
//!
//! ```text
//! discover ──▶ render ──▶ encode ──▶ extract ──▶ normalize
//! (walkdir,    (pdfium /   (base64    (VLM, retry)  (JSON → typed
//!  sha256)      image)      PNG)                     fields)
//! ```
//!
//! 1. [`discover`] : list candidate files and fingerprint their bytes
//! 2. [`render`]   : rasterise pages; runs in `spawn_blocking` because
//!    pdfium is not async-safe
//! 3. [`encode`]   : PNG-encode and base64-wrap each page for the
//!    multimodal request body
//! 4. [`extract`]  : the [`extract::FieldExtractor`] contract and its VLM
//!    implementation; the only stage with network I/O
//! 5. [`normalize`]: parse the reply and coerce dates, amounts and
//!    quantities into [`crate::schema::FieldValue`]s

pub mod discover;
pub mod encode;
pub mod extract;
pub mod normalize;
pub mod render;
