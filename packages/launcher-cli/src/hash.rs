// BLAKE3 checksums for provisioned files and cache keys
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// BLAKE3 digest, rendered as `blake3:<hex>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checksum(blake3::Hash);

impl Checksum {
    /// Digest of an identifier string, used to address the download cache
    pub fn of_identifier(identifier: &str) -> Self {
        Checksum(blake3::hash(identifier.as_bytes()))
    }

    /// Stream a file through the hasher without loading it into memory
    pub fn of_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("Failed to open file: {}", path.display()))?;

        let mut reader = BufReader::with_capacity(1024 * 1024, file);
        let mut hasher = blake3::Hasher::new();
        let mut buffer = [0u8; 16384];

        loop {
            let read = reader
                .read(&mut buffer)
                .with_context(|| format!("Failed to hash file: {}", path.display()))?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }

        Ok(Checksum(hasher.finalize()))
    }

    /// Same as [`Checksum::of_file`], off the async runtime
    pub async fn of_file_blocking(path: PathBuf) -> Result<Self> {
        tokio::task::spawn_blocking(move || Self::of_file(&path))
            .await
            .context("Checksum task panicked")?
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blake3:{}", self.to_hex())
    }
}

impl FromStr for Checksum {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let hex = s.strip_prefix("blake3:").unwrap_or(s);

        if hex.len() != 64 {
            anyhow::bail!("Invalid BLAKE3 checksum length: expected 64 hex chars, got {}", hex.len());
        }

        let bytes = hex::decode(hex).with_context(|| format!("Failed to decode checksum: {}", hex))?;
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&bytes);

        Ok(Checksum(blake3::Hash::from(digest)))
    }
}

impl Serialize for Checksum {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Checksum::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_file_checksum_matches_in_memory_digest() {
        let mut file = NamedTempFile::new().unwrap();
        let data = vec![0xAB; 100_000];
        file.write_all(&data).unwrap();

        let checksum = Checksum::of_file(file.path()).unwrap();
        assert_eq!(checksum.0, blake3::hash(&data));
    }

    #[test]
    fn test_empty_file_checksum() {
        let file = NamedTempFile::new().unwrap();
        let checksum = Checksum::of_file(file.path()).unwrap();
        assert_eq!(
            checksum.to_hex(),
            "af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262"
        );
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Checksum::of_file("/definitely/not/here").is_err());
    }

    #[test]
    fn test_identifier_keys_are_stable_and_distinct() {
        let a = Checksum::of_identifier("s3://bucket/a");
        assert_eq!(a, Checksum::of_identifier("s3://bucket/a"));
        assert_ne!(a, Checksum::of_identifier("s3://bucket/b"));
    }

    #[test]
    fn test_display_and_parse() {
        let checksum = Checksum::of_identifier("x");
        let rendered = checksum.to_string();
        assert!(rendered.starts_with("blake3:"));
        assert_eq!(Checksum::from_str(&rendered).unwrap(), checksum);
        assert_eq!(Checksum::from_str(&checksum.to_hex()).unwrap(), checksum);
        assert!(Checksum::from_str("blake3:tooshort").is_err());
    }

    #[tokio::test]
    async fn test_blocking_variant() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();

        let checksum = Checksum::of_file_blocking(file.path().to_path_buf()).await.unwrap();
        assert_eq!(
            checksum.to_hex(),
            "d74981efa70a0c880b8d8c1985d075dbcbf679b99a5f9914e5aaf96b831a9e24"
        );
    }
}
