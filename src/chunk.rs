//! Fixed-size character chunker.
//!
//! Splits document text into [`Chunk`]s of at most `chunk_size` characters.
//! Split points are character offsets, never inside a UTF-8 sequence, with no
//! word or sentence awareness. With `chunk_overlap > 0` each chunk after the
//! first repeats the trailing `chunk_overlap` characters of its predecessor.
//!
//! Chunking is lazy: [`Chunker::chunks`] returns an iterator that borrows the
//! document, and calling it again restarts from the beginning.

use anyhow::{bail, Result};

use crate::models::{Chunk, Document};

/// Splits documents into fixed-size character windows.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl Chunker {
    /// # Errors
    ///
    /// Returns an error if `chunk_size` is zero or `chunk_overlap` is not
    /// smaller than `chunk_size`.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            bail!("chunk_size must be > 0");
        }
        if chunk_overlap >= chunk_size {
            bail!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                chunk_overlap,
                chunk_size
            );
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }

    /// Lazily chunk a document. Empty documents yield nothing.
    pub fn chunks<'a>(&self, document: &'a Document) -> Chunks<'a> {
        Chunks {
            source_path: &document.source_path,
            text: &document.content,
            pos: 0,
            index: 0,
            size: self.chunk_size,
            step: self.chunk_size - self.chunk_overlap,
            done: document.content.is_empty(),
        }
    }

    /// Chunk a sequence of documents into one flat list, in document order.
    pub fn chunk_all(&self, documents: &[Document]) -> Vec<Chunk> {
        documents.iter().flat_map(|doc| self.chunks(doc)).collect()
    }
}

/// Iterator over the chunks of one document.
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    source_path: &'a str,
    text: &'a str,
    /// Byte offset of the next chunk's first character.
    pos: usize,
    index: usize,
    size: usize,
    step: usize,
    done: bool,
}

impl Iterator for Chunks<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.done {
            return None;
        }

        let rest = &self.text[self.pos..];
        let end = byte_offset_of_char(rest, self.size);
        let chunk = Chunk {
            source_path: self.source_path.to_string(),
            index: self.index,
            text: rest[..end].to_string(),
        };

        if end == rest.len() {
            self.done = true;
        } else {
            self.pos += byte_offset_of_char(rest, self.step);
            self.index += 1;
        }

        Some(chunk)
    }
}

/// Byte offset of the `n`th character of `s`, or `s.len()` if it is shorter.
fn byte_offset_of_char(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(content: &str) -> Document {
        Document {
            source_path: "src/lib.rs".to_string(),
            content: content.to_string(),
        }
    }

    fn texts(chunker: &Chunker, content: &str) -> Vec<String> {
        chunker.chunks(&doc(content)).map(|c| c.text).collect()
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunker = Chunker::new(1000, 0).unwrap();
        let chunks: Vec<Chunk> = chunker.chunks(&doc("hello world")).collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].text, "hello world");
        assert_eq!(chunks[0].source_path, "src/lib.rs");
    }

    #[test]
    fn test_empty_text_yields_nothing() {
        let chunker = Chunker::new(10, 0).unwrap();
        assert_eq!(chunker.chunks(&doc("")).count(), 0);
    }

    #[test]
    fn test_exact_multiple_of_size() {
        let chunker = Chunker::new(4, 0).unwrap();
        assert_eq!(texts(&chunker, "abcdefgh"), vec!["abcd", "efgh"]);
    }

    #[test]
    fn test_concatenation_is_lossless() {
        let content: String = (0..257).map(|i| format!("line {}\n", i)).collect();
        for size in [1, 7, 64, 1000, 5000] {
            let chunker = Chunker::new(size, 0).unwrap();
            let chunks = texts(&chunker, &content);
            assert_eq!(chunks.concat(), content, "size {}", size);
            let chars = content.chars().count();
            assert_eq!(chunks.len(), chars.div_ceil(size), "size {}", size);
            assert!(chunks.iter().all(|c| c.chars().count() <= size));
        }
    }

    #[test]
    fn test_overlap_repeats_trailing_characters() {
        let chunker = Chunker::new(5, 2).unwrap();
        let chunks = texts(&chunker, "abcdefghijk");
        assert_eq!(chunks, vec!["abcde", "defgh", "ghijk"]);
        for pair in chunks.windows(2) {
            let prev: Vec<char> = pair[0].chars().collect();
            let tail: String = prev[prev.len() - 2..].iter().collect();
            assert!(pair[1].starts_with(&tail));
        }
    }

    #[test]
    fn test_overlap_final_chunk_may_be_short() {
        let chunker = Chunker::new(5, 2).unwrap();
        assert_eq!(texts(&chunker, "abcdefg"), vec!["abcde", "defg"]);
    }

    #[test]
    fn test_multibyte_characters_are_not_split() {
        let chunker = Chunker::new(3, 0).unwrap();
        let content = "héllo wörld ✓✓";
        let chunks = texts(&chunker, content);
        assert_eq!(chunks.concat(), content);
        assert_eq!(chunks[0], "hél");
        assert!(chunks.iter().all(|c| c.chars().count() <= 3));
    }

    #[test]
    fn test_indices_contiguous_and_restartable() {
        let chunker = Chunker::new(3, 1).unwrap();
        let d = doc("the quick brown fox");
        let first: Vec<Chunk> = chunker.chunks(&d).collect();
        let second: Vec<Chunk> = chunker.chunks(&d).collect();
        assert_eq!(first, second);
        for (i, c) in first.iter().enumerate() {
            assert_eq!(c.index, i);
        }
    }

    #[test]
    fn test_chunk_all_preserves_document_order() {
        let chunker = Chunker::new(2, 0).unwrap();
        let docs = vec![
            Document {
                source_path: "a.py".to_string(),
                content: "abc".to_string(),
            },
            Document {
                source_path: "b.py".to_string(),
                content: String::new(),
            },
            Document {
                source_path: "c.py".to_string(),
                content: "de".to_string(),
            },
        ];
        let order: Vec<(String, usize, String)> = chunker
            .chunk_all(&docs)
            .into_iter()
            .map(|c| (c.source_path, c.index, c.text))
            .collect();
        assert_eq!(
            order,
            vec![
                ("a.py".to_string(), 0, "ab".to_string()),
                ("a.py".to_string(), 1, "c".to_string()),
                ("c.py".to_string(), 0, "de".to_string()),
            ]
        );
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(Chunker::new(0, 0).is_err());
        assert!(Chunker::new(5, 5).is_err());
        assert!(Chunker::new(5, 9).is_err());
    }
}
