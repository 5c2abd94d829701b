pub mod chunker;
pub mod csv;
pub mod pdf;

use bytes::Bytes;
use std::collections::HashMap;

use crate::config::TxtChunkConfig;
use crate::error::{EngineError, EngineResult};
use crate::types::{ChunkMeta, DocMeta};

use chunker::SlidingWindow;

/// An ingest payload: raw bytes plus whatever the caller knows about them.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub bytes: Bytes,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub csv: CsvOptions,
}

impl SourceDocument {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            filename: None,
            content_type: None,
            csv: CsvOptions::default(),
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_csv_options(mut self, csv: CsvOptions) -> Self {
        self.csv = csv;
        self
    }
}

/// CSV ingestion knobs.
#[derive(Debug, Clone, Default)]
pub struct CsvOptions {
    /// Defaults to true when unset.
    pub has_header: Option<bool>,
    /// Columns projected into per-chunk metadata instead of chunk text.
    pub meta_cols: Vec<String>,
    /// Row filter: only rows whose named columns equal these values.
    pub include_cols: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Text,
    Pdf,
    Csv,
}

/// A chunk before rid assignment.
#[derive(Debug, Clone)]
pub struct RawChunk {
    pub text: String,
    pub meta: ChunkMeta,
}

/// Ordered chunks plus the document-level metadata derived from the source.
#[derive(Debug, Clone)]
pub struct PreparedDocument {
    pub chunks: Vec<RawChunk>,
    pub meta: DocMeta,
}

/// Resolve the content kind: explicit hint, then filename extension, then a
/// magic-byte sniff, then UTF-8 text as the fallback.
pub fn resolve_kind(source: &SourceDocument) -> EngineResult<ContentKind> {
    if let Some(ct) = source.content_type.as_deref() {
        let ct = ct.split(';').next().unwrap_or(ct).trim().to_lowercase();
        match ct.as_str() {
            "application/pdf" => return Ok(ContentKind::Pdf),
            "text/csv" | "application/csv" => return Ok(ContentKind::Csv),
            "application/octet-stream" | "" => {}
            other if other.starts_with("text/") || other == "application/json" => {
                return Ok(ContentKind::Text)
            }
            other => {
                return Err(EngineError::UnsupportedMedia(format!(
                    "content type '{other}' is not supported (txt, csv, pdf)"
                )))
            }
        }
    }

    if let Some(ext) = source
        .filename
        .as_deref()
        .and_then(|f| std::path::Path::new(f).extension())
        .and_then(|e| e.to_str())
    {
        match ext.to_lowercase().as_str() {
            "pdf" => return Ok(ContentKind::Pdf),
            "csv" => return Ok(ContentKind::Csv),
            _ => return Ok(ContentKind::Text),
        }
    }

    if source.bytes.starts_with(b"%PDF-") {
        return Ok(ContentKind::Pdf);
    }
    if std::str::from_utf8(&source.bytes).is_ok() {
        return Ok(ContentKind::Text);
    }
    Err(EngineError::UnsupportedMedia(
        "payload is neither recognizable text nor a known binary format".to_string(),
    ))
}

/// Turn a source into ordered chunks plus document metadata. Chunk ordinals
/// are assigned by the caller (1-based position in the returned sequence),
/// so identical sources always produce identical rids.
pub fn preprocess(
    source: &SourceDocument,
    txt: &TxtChunkConfig,
) -> EngineResult<PreparedDocument> {
    let kind = resolve_kind(source)?;

    let mut meta = DocMeta {
        filename: source.filename.clone(),
        content_type: source.content_type.clone().or_else(|| {
            Some(
                match kind {
                    ContentKind::Text => "text/plain",
                    ContentKind::Pdf => "application/pdf",
                    ContentKind::Csv => "text/csv",
                }
                .to_string(),
            )
        }),
        ..Default::default()
    };

    let chunks = match kind {
        ContentKind::Text => {
            let text = std::str::from_utf8(&source.bytes).map_err(|_| {
                EngineError::UnsupportedMedia("text payload is not valid UTF-8".to_string())
            })?;
            SlidingWindow::new(txt.size, txt.overlap)
                .chunk(text)
                .into_iter()
                .map(|w| RawChunk {
                    text: w.text,
                    meta: ChunkMeta {
                        offset: Some(w.offset as u64),
                        ..Default::default()
                    },
                })
                .collect()
        }
        ContentKind::Pdf => pdf::chunk_pdf(&source.bytes, &mut meta)?,
        ContentKind::Csv => csv::chunk_csv(&source.bytes, &source.csv)?,
    };

    Ok(PreparedDocument { chunks, meta })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_hint_wins() {
        let src = SourceDocument::new(&b"a,b\n1,2"[..])
            .with_filename("data.txt")
            .with_content_type("text/csv");
        assert_eq!(resolve_kind(&src).unwrap(), ContentKind::Csv);
    }

    #[test]
    fn extension_used_without_hint() {
        let src = SourceDocument::new(&b"x"[..]).with_filename("doc.PDF");
        assert_eq!(resolve_kind(&src).unwrap(), ContentKind::Pdf);
        let src = SourceDocument::new(&b"x"[..]).with_filename("notes.md");
        assert_eq!(resolve_kind(&src).unwrap(), ContentKind::Text);
    }

    #[test]
    fn magic_bytes_sniffed() {
        let src = SourceDocument::new(&b"%PDF-1.7 rest"[..]);
        assert_eq!(resolve_kind(&src).unwrap(), ContentKind::Pdf);
    }

    #[test]
    fn unknown_content_type_is_rejected() {
        let src = SourceDocument::new(&b"x"[..]).with_content_type("image/png");
        let err = resolve_kind(&src).unwrap_err();
        assert_eq!(err.code(), "unsupported_media");
    }

    #[test]
    fn undecodable_binary_is_rejected() {
        let src = SourceDocument::new(&[0xff, 0xfe, 0x00, 0x80][..]);
        let err = resolve_kind(&src).unwrap_err();
        assert_eq!(err.code(), "unsupported_media");
    }

    #[test]
    fn txt_chunks_carry_offsets() {
        let cfg = TxtChunkConfig {
            size: 10,
            overlap: 2,
        };
        let src = SourceDocument::new(&b"abcdefghijklmnopqrstuvwxyz"[..]).with_filename("abc.txt");
        let prepared = preprocess(&src, &cfg).unwrap();
        assert!(prepared.chunks.len() > 1);
        assert_eq!(prepared.chunks[0].meta.offset, Some(0));
        assert_eq!(prepared.chunks[1].meta.offset, Some(8));
        assert_eq!(prepared.meta.filename.as_deref(), Some("abc.txt"));
        assert_eq!(prepared.meta.content_type.as_deref(), Some("text/plain"));
    }

    #[test]
    fn invalid_utf8_text_is_unsupported() {
        let src = SourceDocument::new(&[0xff, 0xfe][..]).with_filename("broken.txt");
        let err = preprocess(&src, &TxtChunkConfig::default()).unwrap_err();
        assert_eq!(err.code(), "unsupported_media");
    }
}
