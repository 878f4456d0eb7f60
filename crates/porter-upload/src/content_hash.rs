//! Block content hash sent with each commit so the server can verify what
//! it assembled: SHA-256 over the concatenated SHA-256 digests of each
//! 4 MiB block, hex encoded.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

pub const BLOCK_SIZE: usize = 4 * 1024 * 1024;

pub fn content_hash_of(bytes: &[u8]) -> String {
    let mut overall = Sha256::new();
    for block in bytes.chunks(BLOCK_SIZE) {
        overall.update(Sha256::digest(block));
    }
    hex::encode(overall.finalize())
}

pub fn file_content_hash(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut overall = Sha256::new();
    let mut block = vec![0u8; BLOCK_SIZE];
    loop {
        let filled = read_block(&mut file, &mut block)?;
        if filled == 0 {
            break;
        }
        overall.update(Sha256::digest(&block[..filled]));
        if filled < BLOCK_SIZE {
            break;
        }
    }
    Ok(hex::encode(overall.finalize()))
}

/// Hash on the blocking pool.
pub async fn content_hash(path: PathBuf) -> io::Result<String> {
    tokio::task::spawn_blocking(move || file_content_hash(&path))
        .await
        .map_err(io::Error::other)?
}

fn read_block(file: &mut File, block: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < block.len() {
        match file.read(&mut block[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_hashes_no_blocks() {
        assert_eq!(
            content_hash_of(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn single_block_is_hash_of_hash() {
        let expected = hex::encode(Sha256::digest(Sha256::digest(b"hello")));
        assert_eq!(content_hash_of(b"hello"), expected);
    }

    #[test]
    fn file_hash_matches_in_memory_across_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.bin");
        let data: Vec<u8> = (0..BLOCK_SIZE + 1234).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();
        assert_eq!(file_content_hash(&path).unwrap(), content_hash_of(&data));
    }
}
