use lopdf::{Document, Object};

use crate::error::{EngineError, EngineResult};
use crate::types::{ChunkMeta, DocMeta};

use super::RawChunk;

/// Extract one chunk per page. Pages without extractable text are emitted as
/// empty strings so page numbering stays aligned with the source document.
pub fn chunk_pdf(bytes: &[u8], doc_meta: &mut DocMeta) -> EngineResult<Vec<RawChunk>> {
    let doc = Document::load_mem(bytes)
        .map_err(|e| EngineError::UnsupportedMedia(format!("unreadable pdf: {e}")))?;

    let (title, author) = extract_info(&doc);
    if doc_meta.title.is_none() {
        doc_meta.title = title;
    }
    if doc_meta.author.is_none() {
        doc_meta.author = author;
    }

    let page_numbers: Vec<u32> = doc.get_pages().keys().copied().collect();
    let mut chunks = Vec::with_capacity(page_numbers.len());
    for (i, page_no) in page_numbers.iter().enumerate() {
        let text = doc
            .extract_text(&[*page_no])
            .map(|t| clean_page_text(&t))
            .unwrap_or_default();
        chunks.push(RawChunk {
            text,
            meta: ChunkMeta {
                page: Some(i as u32 + 1),
                ..Default::default()
            },
        });
    }
    Ok(chunks)
}

/// Collapse extraction artifacts: trim each line, drop blank runs.
fn clean_page_text(raw: &str) -> String {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Pull Title/Author out of the trailer Info dictionary, resolving the
/// reference rather than assuming a fixed object id.
fn extract_info(doc: &Document) -> (Option<String>, Option<String>) {
    let info = doc
        .trailer
        .get(b"Info")
        .ok()
        .and_then(|info_ref| match info_ref {
            Object::Reference(ref_id) => doc.get_object(*ref_id).ok(),
            other => Some(other),
        });

    let Some(info) = info else {
        return (None, None);
    };
    let Ok(dict) = info.as_dict() else {
        return (None, None);
    };

    let field = |name: &[u8]| {
        dict.get(name).ok().and_then(|obj| match obj {
            Object::String(bytes, _) => decode_pdf_string(bytes),
            _ => None,
        })
    };
    (field(b"Title"), field(b"Author"))
}

fn decode_pdf_string(bytes: &[u8]) -> Option<String> {
    let decoded: String = String::from_utf8_lossy(bytes)
        .chars()
        .filter(|c| *c != '\u{0}' && *c != '\u{feff}')
        .collect();
    let trimmed = decoded.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
