use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Filesystem-backed `rid -> text` map: one file per chunk under `chunks/`.
///
/// This is the authoritative text source when the vector backend returns a
/// hit without payload. Writes happen inside the ingest lock; reads are
/// lock-free.
#[derive(Debug)]
pub struct Sidecar {
    dir: PathBuf,
}

impl Sidecar {
    pub fn open(collection_dir: &Path) -> Result<Self> {
        let dir = collection_dir.join("chunks");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create sidecar dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, rid: &str) -> PathBuf {
        self.dir.join(format!("{}.txt", encode_rid(rid)))
    }

    pub fn write(&self, rid: &str, text: &str) -> Result<()> {
        let path = self.path_for(rid);
        std::fs::write(&path, text)
            .with_context(|| format!("failed to write sidecar file {}", path.display()))
    }

    /// Lock-free read; `None` when the chunk file is missing.
    pub fn read(&self, rid: &str) -> Option<String> {
        std::fs::read_to_string(self.path_for(rid)).ok()
    }

    /// Best-effort removal; returns how many files were actually deleted.
    pub fn remove(&self, rids: &[String]) -> usize {
        rids.iter()
            .filter(|rid| std::fs::remove_file(self.path_for(rid)).is_ok())
            .count()
    }
}

/// Encode a rid as a filesystem-safe name: the docid alphabet passes
/// through, everything else (including the `::` separator) is
/// percent-escaped byte-wise.
fn encode_rid(rid: &str) -> String {
    let mut out = String::with_capacity(rid.len());
    for b in rid.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'_' | b'-' => out.push(b as char),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_is_safe_and_distinct() {
        assert_eq!(encode_rid("doc::1"), "doc%3A%3A1");
        assert_eq!(encode_rid("a/b::2"), "a%2Fb%3A%3A2");
        assert_ne!(encode_rid("a::12"), encode_rid("a::1"));
    }

    #[test]
    fn write_read_remove_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let sidecar = Sidecar::open(tmp.path()).unwrap();

        sidecar.write("verne-20k::1", "captain nemo").unwrap();
        sidecar.write("verne-20k::2", "the nautilus").unwrap();
        assert_eq!(sidecar.read("verne-20k::1").as_deref(), Some("captain nemo"));
        assert_eq!(sidecar.read("verne-20k::3"), None);

        let removed = sidecar.remove(&[
            "verne-20k::1".to_string(),
            "verne-20k::2".to_string(),
            "verne-20k::9".to_string(),
        ]);
        assert_eq!(removed, 2);
        assert_eq!(sidecar.read("verne-20k::1"), None);
    }

    #[test]
    fn unicode_rids_are_stored() {
        let tmp = tempfile::tempdir().unwrap();
        let sidecar = Sidecar::open(tmp.path()).unwrap();
        sidecar.write("döc::1", "text").unwrap();
        assert_eq!(sidecar.read("döc::1").as_deref(), Some("text"));
    }
}
