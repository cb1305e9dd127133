use std::collections::HashSet;
use std::io::{Cursor, Write};

use zip::result::ZipError;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::certificate::GeneratedDocument;

#[derive(thiserror::Error, Debug)]
pub enum ArchiveError {
    #[error("Failed to add '{filename}' to the archive")]
    Entry {
        filename: String,
        #[source]
        source: ZipError,
    },
    #[error("Failed to finalize the archive")]
    Finish(#[source] ZipError),
}

/// Collects every generated certificate into one flat, deflated zip.
///
/// Derived filenames can collide when two recipients share a name. The
/// first claim keeps the plain name and later ones get `_2`, `_3`, ...
/// before the extension, so no certificate is overwritten.
pub struct ArchivePackager {
    writer: ZipWriter<Cursor<Vec<u8>>>,
    claimed: HashSet<String>,
    entries: Vec<String>,
}

impl Default for ArchivePackager {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchivePackager {
    pub fn new() -> Self {
        Self {
            writer: ZipWriter::new(Cursor::new(Vec::new())),
            claimed: HashSet::new(),
            entries: Vec::new(),
        }
    }

    /// Reserves an entry name derived from `filename`, unique within this archive.
    pub fn claim_filename(&mut self, filename: &str) -> String {
        let mut candidate = filename.to_owned();
        let mut n = 1;
        while self.claimed.contains(&candidate) {
            n += 1;
            candidate = numbered(filename, n);
        }
        self.claimed.insert(candidate.clone());
        candidate
    }

    pub fn add(&mut self, document: &GeneratedDocument) -> Result<(), ArchiveError> {
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
        let entry_error = |source| ArchiveError::Entry {
            filename: document.filename.clone(),
            source,
        };

        self.writer
            .start_file(document.filename.as_str(), options)
            .map_err(entry_error)?;
        self.writer
            .write_all(&document.bytes)
            .map_err(|e| entry_error(ZipError::Io(e)))?;
        self.entries.push(document.filename.clone());
        Ok(())
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn finish(mut self) -> Result<Vec<u8>, ArchiveError> {
        let cursor = self.writer.finish().map_err(ArchiveError::Finish)?;
        Ok(cursor.into_inner())
    }
}

/// `certificado_ana.pdf` + 2 → `certificado_ana_2.pdf`
fn numbered(filename: &str, n: usize) -> String {
    match filename.rsplit_once('.') {
        Some((stem, extension)) => format!("{}_{}.{}", stem, n, extension),
        None => format!("{}_{}", filename, n),
    }
}
