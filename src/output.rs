//! Per-page Markdown files and the assembled document.
//!
//! Each finished page is written to `{output_dir}/.pages/page_NNNN.md` before
//! its `page_completed` event is logged, so a completion in the log always
//! has its text on disk. The final document is rebuilt from those files at
//! the end of every run, which is what makes resuming across runs possible.

use crate::error::TranscriberError;
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Directory holding per-page files, inside the job's output directory.
pub const PAGES_DIR: &str = ".pages";

/// Location of the assembled Markdown for a job.
pub fn output_path_for(output_dir: &Path, job_id: &str) -> PathBuf {
    output_dir.join(format!("{job_id}.md"))
}

/// Write `contents` to `path` via a temp file in the same directory and an
/// atomic rename.
pub fn write_atomic(path: &Path, contents: &str) -> Result<(), TranscriberError> {
    let write_err = |source| TranscriberError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(write_err)?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(contents.as_bytes()).map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}

/// Page files of one job.
#[derive(Debug, Clone)]
pub struct PageStore {
    dir: PathBuf,
}

impl PageStore {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            dir: output_dir.join(PAGES_DIR),
        }
    }

    pub fn page_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("page_{:04}.md", index + 1))
    }

    pub fn write(&self, index: usize, markdown: &str) -> Result<(), TranscriberError> {
        let path = self.page_path(index);
        write_atomic(&path, markdown)?;
        debug!("Saved page {} → {}", index + 1, path.display());
        Ok(())
    }

    pub fn read(&self, index: usize) -> Option<String> {
        fs::read_to_string(self.page_path(index)).ok()
    }

    /// Join all completed pages in order; anything else becomes a placeholder.
    pub fn assemble(&self, total_pages: usize, completed: &BTreeSet<usize>) -> String {
        let mut parts = Vec::with_capacity(total_pages);
        for index in 0..total_pages {
            let page = if completed.contains(&index) {
                self.read(index)
            } else {
                None
            };
            match page {
                Some(text) => parts.push(text.trim().to_string()),
                None => {
                    if completed.contains(&index) {
                        warn!("Page {} is logged as completed but its file is missing", index + 1);
                    }
                    parts.push(format!("<!-- page {} not transcribed -->", index + 1));
                }
            }
        }
        let mut doc = parts.join("\n\n");
        doc.push('\n');
        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_are_numbered_from_one() {
        let store = PageStore::new(Path::new("/out/paper"));
        assert_eq!(store.page_path(0), Path::new("/out/paper/.pages/page_0001.md"));
    }

    #[test]
    fn assemble_keeps_order_and_marks_gaps() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PageStore::new(tmp.path());
        store.write(2, "third\n").unwrap();
        store.write(0, "first").unwrap();

        let doc = store.assemble(3, &BTreeSet::from([0, 2]));
        assert_eq!(doc, "first\n\n<!-- page 2 not transcribed -->\n\nthird\n");
    }

    #[test]
    fn atomic_write_replaces_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("doc.md");
        write_atomic(&path, "v1").unwrap();
        write_atomic(&path, "v2").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "v2");
    }
}
