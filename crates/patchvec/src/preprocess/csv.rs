use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::types::ChunkMeta;

use super::{CsvOptions, RawChunk};

/// One chunk per data row. With a header, column names become metadata keys:
/// `meta_cols` columns are projected into per-chunk metadata and the rest
/// concatenate into `name: value` lines of chunk text. `include_cols` keeps
/// only rows whose named columns equal the given values.
pub fn chunk_csv(bytes: &[u8], opts: &CsvOptions) -> EngineResult<Vec<RawChunk>> {
    let has_header = opts.has_header.unwrap_or(true);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(has_header)
        .flexible(true)
        .from_reader(bytes);

    let headers: Vec<String> = if has_header {
        reader
            .headers()
            .map_err(|e| EngineError::InvalidRequest(format!("csv header: {e}")))?
            .iter()
            .map(str::to_string)
            .collect()
    } else {
        Vec::new()
    };

    let column_name = |idx: usize| -> String {
        headers
            .get(idx)
            .cloned()
            .unwrap_or_else(|| format!("col_{}", idx + 1))
    };

    let mut chunks = Vec::new();
    for (row_idx, record) in reader.records().enumerate() {
        let record =
            record.map_err(|e| EngineError::InvalidRequest(format!("csv row {}: {e}", row_idx + 1)))?;
        let row_no = row_idx as u64 + 1;

        let cell = |name: &str| -> Option<&str> {
            headers
                .iter()
                .position(|h| h == name)
                .and_then(|i| record.get(i))
        };
        if !opts
            .include_cols
            .iter()
            .all(|(col, want)| cell(col) == Some(want.as_str()))
        {
            continue;
        }

        let mut meta = ChunkMeta {
            row: Some(row_no),
            ..Default::default()
        };
        let mut lines = Vec::new();
        for (idx, value) in record.iter().enumerate() {
            let name = column_name(idx);
            if opts.meta_cols.contains(&name) {
                meta.extra.insert(name, Value::String(value.to_string()));
            } else {
                lines.push(format!("{name}: {value}"));
            }
        }

        chunks.push(RawChunk {
            text: lines.join("\n"),
            meta,
        });
    }
    Ok(chunks)
}
