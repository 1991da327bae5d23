//! Paper identifiers recovered from PDF filenames.
//!
//! DOIs contain `/`, which can't appear in a filename, so our PDFs are named
//! with `+` in its place: `10.1371+journal.pone.0000001.pdf`.

use std::fmt;

use crate::prelude::*;

/// An identifier for a paper, usually a DOI.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PaperId(String);

impl PaperId {
    /// Recover a paper ID from the path to its PDF.
    pub fn from_pdf_path(path: &Path) -> Result<Self> {
        let file_name = path
            .file_name()
            .ok_or_else(|| anyhow!("no file name in {:?}", path.display()))?
            .to_string_lossy();
        let stem = strip_pdf_extension(&file_name);
        Ok(Self(stem.replace('+', "/")))
    }
}

impl fmt::Display for PaperId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Remove a trailing `.pdf`, ignoring case.
fn strip_pdf_extension(file_name: &str) -> &str {
    let split = file_name.len().saturating_sub(4);
    match file_name.get(split..) {
        Some(ext) if ext.eq_ignore_ascii_case(".pdf") => &file_name[..split],
        _ => file_name,
    }
}
