//! Reads selected files into [`Document`]s.
//!
//! Files are read on the blocking pool with bounded parallelism. Results are
//! collected in input order, so the document sequence (and every chunk
//! derived from it) does not depend on which read finishes first.
//!
//! A file that cannot be read or is not valid UTF-8 is skipped with a
//! warning and counted; it never fails the run.

use std::path::{Path, PathBuf};

use anyhow::Result;
use futures::stream::{self, StreamExt};

use crate::filter::FileFilter;
use crate::models::Document;

/// Outcome of loading a set of files.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub documents: Vec<Document>,
    pub files_seen: usize,
    pub files_skipped: usize,
}

/// Read every file the filter selects.
///
/// # Errors
///
/// Only fails if a blocking read task panics; unreadable files are skipped.
pub async fn load_documents(filter: &FileFilter, concurrency: usize) -> Result<LoadReport> {
    let files: Vec<(PathBuf, String)> = filter
        .files()
        .map(|path| {
            let rel = filter.relative_path(&path);
            (path, rel)
        })
        .collect();

    load_files(files, concurrency).await
}

/// Read `(absolute path, source path)` pairs into documents, keeping order.
pub async fn load_files(files: Vec<(PathBuf, String)>, concurrency: usize) -> Result<LoadReport> {
    let files_seen = files.len();

    let results: Vec<_> = stream::iter(files)
        .map(|(path, source_path)| {
            tokio::task::spawn_blocking(move || {
                let content = read_text(&path);
                (source_path, content)
            })
        })
        .buffered(concurrency.max(1))
        .collect()
        .await;

    let mut report = LoadReport {
        files_seen,
        ..Default::default()
    };

    for joined in results {
        let (source_path, content) = joined?;
        match content {
            Ok(content) => report.documents.push(Document {
                source_path,
                content,
            }),
            Err(e) => {
                tracing::warn!("Skipping {}: {}", source_path, e);
                report.files_skipped += 1;
            }
        }
    }

    tracing::debug!(
        "Loaded {} documents ({} skipped)",
        report.documents.len(),
        report.files_skipped
    );

    Ok(report)
}

fn read_text(path: &Path) -> std::io::Result<String> {
    std::fs::read_to_string(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[tokio::test]
    async fn test_loads_in_walk_order() {
        let tmp = tempfile::tempdir().unwrap();
        for (name, body) in [("b.txt", "bee"), ("a.txt", "ay"), ("sub/c.txt", "see")] {
            let path = tmp.path().join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, body).unwrap();
        }

        let filter = FileFilter::new(tmp.path(), &[]).unwrap();
        let report = load_documents(&filter, 2).await.unwrap();

        assert_eq!(report.files_seen, 3);
        assert_eq!(report.files_skipped, 0);
        let docs: Vec<(&str, &str)> = report
            .documents
            .iter()
            .map(|d| (d.source_path.as_str(), d.content.as_str()))
            .collect();
        assert_eq!(
            docs,
            vec![("a.txt", "ay"), ("b.txt", "bee"), ("sub/c.txt", "see")]
        );
    }

    #[tokio::test]
    async fn test_binary_file_is_skipped_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("good.py"), "print('ok')").unwrap();
        fs::write(tmp.path().join("image.png"), [0x89u8, 0x50, 0xff, 0xfe, 0x00]).unwrap();

        let filter = FileFilter::new(tmp.path(), &[]).unwrap();
        let report = load_documents(&filter, 4).await.unwrap();

        assert_eq!(report.files_seen, 2);
        assert_eq!(report.files_skipped, 1);
        assert_eq!(report.documents.len(), 1);
        assert_eq!(report.documents[0].source_path, "good.py");
    }

    #[tokio::test]
    async fn test_missing_file_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let files = vec![(tmp.path().join("gone.rs"), "gone.rs".to_string())];
        let report = load_files(files, 1).await.unwrap();
        assert_eq!(report.files_skipped, 1);
        assert!(report.documents.is_empty());
    }

    #[tokio::test]
    async fn test_empty_file_becomes_empty_document() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("empty.py"), "").unwrap();
        let filter = FileFilter::new(tmp.path(), &[]).unwrap();
        let report = load_documents(&filter, 1).await.unwrap();
        assert_eq!(report.documents.len(), 1);
        assert!(report.documents[0].content.is_empty());
    }
}
