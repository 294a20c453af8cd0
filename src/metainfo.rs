//! Bencode `.torrent` metainfo parsing.
//!
//! This crate only targets single-file v1 torrents, so [`Metainfo::validate`]
//! rejects anything else as a configuration error rather than silently
//! picking the first file.

use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::Sha1Hash;

/// The length, in bytes, of one encoded piece hash.
const HASH_LEN: usize = 20;

/// The parsed contents of a `.torrent` file.
#[derive(Debug, Clone, Deserialize)]
pub struct Metainfo {
    /// The tracker's announce URL.
    pub announce: String,
    pub info: Info,
}

impl Metainfo {
    /// Parses a metainfo dictionary from its bencoded bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        Ok(serde_bencode::from_bytes(buf)?)
    }

    /// Computes the 20 byte SHA-1 info hash: the hash of the bencoded
    /// `info` dictionary, re-encoded exactly as originally laid out.
    pub fn create_info_hash(&self) -> Result<Sha1Hash> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// Validates that this metainfo describes a single-file v1 torrent with
    /// a consistent piece layout, returning a configuration error otherwise.
    ///
    /// Must be called before the metainfo is used to build a
    /// [`crate::storage_info::StorageInfo`] or start a download; a bad
    /// metainfo is a fatal startup error, not a recoverable one.
    pub fn validate(&self) -> Result<()> {
        if self.info.files.is_some() {
            return Err(Error::InvalidConfig(
                "multi-file torrents are not supported".into(),
            ));
        }
        let length = self.info.length.ok_or_else(|| {
            Error::InvalidConfig("single-file torrent is missing `length`".into())
        })?;
        if self.info.piece_length == 0 {
            return Err(Error::InvalidConfig("piece length must be positive".into()));
        }
        if length == 0 {
            return Err(Error::InvalidConfig(
                "torrent length must be positive".into(),
            ));
        }
        if self.info.pieces.len() % HASH_LEN != 0 {
            return Err(Error::InvalidConfig(
                "pieces field length is not a multiple of 20".into(),
            ));
        }
        let expected_piece_count = div_ceil(length, self.info.piece_length);
        if expected_piece_count != self.piece_count() {
            return Err(Error::InvalidConfig(format!(
                "piece hash count ({}) doesn't match length/piece_length ({})",
                self.piece_count(),
                expected_piece_count
            )));
        }
        Ok(())
    }

    /// The total length of the torrent's single file, in bytes.
    pub fn len(&self) -> u64 {
        // validated to be `Some` by `validate`
        self.info.length.unwrap_or(0)
    }

    /// The nominal length of a piece, in bytes.
    pub fn piece_len(&self) -> u32 {
        self.info.piece_length as u32
    }

    /// The number of pieces listed in the `pieces` field.
    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / HASH_LEN
    }

    /// Returns the expected hash of the piece at `index`.
    pub fn piece_hash(&self, index: usize) -> Option<Sha1Hash> {
        let start = index * HASH_LEN;
        let bytes = self.info.pieces.get(start..start + HASH_LEN)?;
        let mut hash = [0; HASH_LEN];
        hash.copy_from_slice(bytes);
        Some(hash)
    }

    /// The name of the torrent, used as the output file's name.
    pub fn name(&self) -> &str {
        &self.info.name
    }
}

fn div_ceil(a: u64, b: u64) -> usize {
    ((a + b - 1) / b) as usize
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    pub length: Option<u64>,
    pub files: Option<Vec<File>>,
    pub private: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_metainfo(length: u64, piece_length: u64, piece_count: usize) -> Metainfo {
        Metainfo {
            announce: "http://tracker.example.com/announce".into(),
            info: Info {
                name: "foo.bin".into(),
                pieces: vec![0u8; piece_count * HASH_LEN],
                piece_length,
                length: Some(length),
                files: None,
                private: None,
            },
        }
    }

    #[test]
    fn test_validate_accepts_consistent_single_file() {
        let m = single_file_metainfo(32, 16, 2);
        assert!(m.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_multi_file() {
        let mut m = single_file_metainfo(32, 16, 2);
        m.info.files = Some(vec![File {
            path: vec!["a".into()],
            length: 32,
        }]);
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_missing_length() {
        let mut m = single_file_metainfo(32, 16, 2);
        m.info.length = None;
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_hash_count_mismatch() {
        let m = single_file_metainfo(32, 16, 1);
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_piece_hash_round_trip() {
        let mut m = single_file_metainfo(32, 16, 2);
        m.info.pieces[HASH_LEN..HASH_LEN + HASH_LEN].copy_from_slice(&[7u8; HASH_LEN]);
        assert_eq!(m.piece_hash(0), Some([0u8; HASH_LEN]));
        assert_eq!(m.piece_hash(1), Some([7u8; HASH_LEN]));
        assert_eq!(m.piece_hash(2), None);
    }
}
