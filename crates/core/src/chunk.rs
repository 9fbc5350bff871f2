//! Fixed-size streaming chunk codec: splits a file into `CHUNK_SIZE` plaintext
//! windows, encrypts each with the per-content key, and writes decrypted
//! chunks back at their byte offset into a pre-allocated output file.
//!
//! Changing `CHUNK_SIZE` is a wire-format break: existing Chunk rows are
//! indexed by part number, which implies a byte offset of
//! `(part_num - 1) * CHUNK_SIZE`.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::crypto;
use crate::{Error, Result};

pub const CHUNK_SIZE: u64 = 8 * 1024 * 1024;

pub fn chunk_count(size: u64) -> u64 {
    size.div_ceil(CHUNK_SIZE).max(if size == 0 { 0 } else { 1 })
}

/// Lazily reads `path` in `CHUNK_SIZE` windows, encrypting each with `key`.
/// Part numbers already present in `completed_parts` are skipped by seeking
/// forward over their window without reading or encrypting it.
pub struct ChunkStream {
    file: std::fs::File,
    key: [u8; 32],
    completed: HashSet<u64>,
    next_part: u64,
    done: bool,
}

impl ChunkStream {
    pub fn open(path: &Path, key: [u8; 32], completed_parts: HashSet<u64>) -> Result<Self> {
        Ok(Self {
            file: std::fs::File::open(path)?,
            key,
            completed: completed_parts,
            next_part: 1,
            done: false,
        })
    }

    /// Returns the next `(part_num, encrypted_bytes)` pair, or `None` once the
    /// file is exhausted. Not restartable: a given stream is consumed once.
    pub fn next_chunk(&mut self) -> Result<Option<(u64, Vec<u8>)>> {
        if self.done {
            return Ok(None);
        }

        loop {
            let part = self.next_part;
            if self.completed.contains(&part) {
                self.file.seek(SeekFrom::Current(CHUNK_SIZE as i64))?;
                self.next_part += 1;
                continue;
            }

            let mut buf = vec![0u8; CHUNK_SIZE as usize];
            let mut read = 0usize;
            while read < buf.len() {
                let n = self.file.read(&mut buf[read..])?;
                if n == 0 {
                    break;
                }
                read += n;
            }

            if read == 0 {
                self.done = true;
                return Ok(None);
            }

            buf.truncate(read);
            self.next_part += 1;
            let encrypted = crypto::encrypt(&buf, &self.key)?;
            return Ok(Some((part, encrypted)));
        }
    }
}

/// Decrypts `encrypted_bytes` and writes the plaintext at `offset` into
/// `output_path`. Safe under parallel writers as long as their offsets do
/// not overlap.
pub fn write_decrypted(
    encrypted_bytes: &[u8],
    output_path: &Path,
    key: &[u8; 32],
    offset: u64,
) -> Result<()> {
    let plaintext = crypto::decrypt(encrypted_bytes, key)?;
    let mut file = OpenOptions::new().write(true).open(output_path)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(&plaintext)?;
    Ok(())
}

/// Ensures the parent directory exists; if `path` already has the right
/// size, leaves it in place for resume. Otherwise (re-)creates it and
/// sparsely pre-allocates to `expected_size` bytes.
pub fn prepare_output(path: &Path, expected_size: u64) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if path.exists() {
        let current = std::fs::metadata(path)?.len();
        if current == expected_size {
            return Ok(());
        }
    }

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    if expected_size > 0 {
        file.set_len(expected_size)?;
    }
    Ok(())
}

/// Returns `dir/filename`, or `dir/filename (N)` with the smallest `N >= 1`
/// not already present if that path exists. Never overwrites.
pub fn unique_path(dir: &Path, filename: &str) -> PathBuf {
    let candidate = dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }

    let path = Path::new(filename);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename);
    let ext = path.extension().and_then(|s| s.to_str());

    let mut n = 1u64;
    loop {
        let name = match ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = dir.join(&name);
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

pub fn path_to_utf8(path: &Path) -> Result<String> {
    path.to_str().map(str::to_owned).ok_or_else(|| Error::NonUtf8Path {
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn chunk_count_matches_spec_formula() {
        assert_eq!(chunk_count(0), 0);
        assert_eq!(chunk_count(1), 1);
        assert_eq!(chunk_count(CHUNK_SIZE), 1);
        assert_eq!(chunk_count(CHUNK_SIZE + 1), 2);
    }

    #[test]
    fn stream_splits_and_skips_completed_parts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.bin");
        let data = vec![0xABu8; (CHUNK_SIZE * 2 + 100) as usize];
        std::fs::write(&path, &data).unwrap();

        let key = [9u8; 32];
        let mut completed = HashSet::new();
        completed.insert(1u64);

        let mut stream = ChunkStream::open(&path, key, completed).unwrap();
        let mut parts = Vec::new();
        while let Some((part, blob)) = stream.next_chunk().unwrap() {
            parts.push((part, blob));
        }

        assert_eq!(parts.iter().map(|(p, _)| *p).collect::<Vec<_>>(), vec![2, 3]);
        // Part 3 is the short final chunk: 100 plaintext bytes + 28 AEAD overhead.
        assert_eq!(parts[1].1.len(), 100 + 28);
    }

    #[test]
    fn unique_path_appends_smallest_free_n() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"1").unwrap();
        std::fs::write(dir.path().join("a (1).txt"), b"2").unwrap();

        let got = unique_path(dir.path(), "a.txt");
        assert_eq!(got, dir.path().join("a (2).txt"));
    }

    #[test]
    fn prepare_output_preallocates_and_preserves_on_matching_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");

        prepare_output(&path, 1024).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 1024);

        std::fs::write(&path, vec![7u8; 1024]).unwrap();
        prepare_output(&path, 1024).unwrap();
        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents, vec![7u8; 1024]);
    }

    #[test]
    fn prepare_output_resets_on_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");

        std::fs::write(&path, vec![7u8; 10]).unwrap();
        prepare_output(&path, 1024).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 1024);
    }
}
