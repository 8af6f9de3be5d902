//! The meta-info ("torrent file") input structure.
//!
//! The engine consumes an immutable view of the torrent's info dictionary:
//! the info hash, the piece hashes, the file list with sizes, the private
//! flag and the announce groups. This module supplies that view from the
//! bencoded form.

use sha1::{Digest, Sha1};
use url::Url;

use crate::{error::*, FileInfo, InfoHash, Sha1Hash};

#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub info: Info,
    #[serde(default)]
    pub announce: Option<String>,
    #[serde(rename = "announce-list", default)]
    pub announce_list: Option<Vec<Vec<String>>>,
}

impl Metainfo {
    /// Parses and validates a bencoded metainfo document.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let metainfo: Self = serde_bencode::from_bytes(buf)?;
        metainfo.validate()?;
        Ok(metainfo)
    }

    fn validate(&self) -> Result<()> {
        if self.info.name.is_empty() {
            log::warn!("Metainfo has empty name");
            return Err(Error::InvalidMetainfo);
        }
        if self.info.piece_length == 0 {
            log::warn!("Metainfo has zero piece length");
            return Err(Error::InvalidMetainfo);
        }
        // the pieces field is the concatenation of 20 byte SHA-1 digests
        if self.info.pieces.is_empty() || self.info.pieces.len() % 20 != 0 {
            log::warn!(
                "Metainfo pieces length {} not a multiple of 20",
                self.info.pieces.len()
            );
            return Err(Error::InvalidMetainfo);
        }
        // exactly one of the single and multi file forms must be present
        match (&self.info.length, &self.info.files) {
            (Some(_), Some(_)) | (None, None) => {
                log::warn!("Metainfo must be single or multi file");
                return Err(Error::InvalidMetainfo);
            }
            _ => {}
        }
        if let Some(files) = &self.info.files {
            if files.is_empty()
                || files.iter().any(|file| {
                    file.length == 0 || file.path.is_empty()
                })
            {
                log::warn!("Metainfo has invalid file list");
                return Err(Error::InvalidMetainfo);
            }
        }
        // the pieces must exactly cover the download
        let total = self.total_len();
        let piece_len = self.info.piece_length;
        let piece_count = self.piece_count() as u64;
        if total == 0
            || total <= (piece_count - 1) * piece_len
            || total > piece_count * piece_len
        {
            log::warn!(
                "Metainfo piece count {} doesn't cover {} bytes",
                piece_count,
                total
            );
            return Err(Error::InvalidMetainfo);
        }
        Ok(())
    }

    /// Computes the torrent's info hash: the SHA-1 digest of the bencoded
    /// info dictionary.
    pub fn create_info_hash(&self) -> Result<InfoHash> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// The nominal piece length. The last piece may be shorter.
    pub fn piece_len(&self) -> u32 {
        self.info.piece_length as u32
    }

    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    /// The expected hash of the piece at the index.
    ///
    /// # Panics
    ///
    /// Panics if the index is out of bounds; callers index within
    /// `0..piece_count`.
    pub fn piece_hash(&self, index: usize) -> Sha1Hash {
        let mut hash = [0; 20];
        hash.copy_from_slice(&self.info.pieces[index * 20..index * 20 + 20]);
        hash
    }

    /// The concatenation of all piece hashes, in piece order.
    pub fn piece_hashes(&self) -> &[u8] {
        &self.info.pieces
    }

    /// The sum of all file lengths.
    pub fn total_len(&self) -> u64 {
        match (&self.info.length, &self.info.files) {
            (Some(len), _) => *len,
            (None, Some(files)) => {
                files.iter().map(|file| file.length).sum()
            }
            (None, None) => 0,
        }
    }

    pub fn is_multi_file(&self) -> bool {
        self.info.files.is_some()
    }

    /// Whether the torrent is private (BEP-27): private torrents must not be
    /// announced over LSD nor accept LSD discovered peers.
    pub fn is_private(&self) -> bool {
        self.info.private == Some(1)
    }

    /// The logical file list: relative paths, lengths and the byte offset of
    /// each file in the concatenated torrent byte stream. Offsets are
    /// contiguous by construction.
    pub fn files(&self) -> Vec<FileInfo> {
        match &self.info.files {
            None => vec![FileInfo {
                path: self.info.name.clone().into(),
                len: self.info.length.unwrap_or_default(),
                torrent_offset: 0,
            }],
            Some(files) => {
                let mut torrent_offset = 0;
                files
                    .iter()
                    .map(|file| {
                        let info = FileInfo {
                            path: file.path.iter().collect(),
                            len: file.length,
                            torrent_offset,
                        };
                        torrent_offset += file.length;
                        info
                    })
                    .collect()
            }
        }
    }

    /// The tracker announce groups: the tiers of the announce-list, or a
    /// single tier holding the announce URL. Unparsable URLs are dropped
    /// with a warning.
    pub fn announce_groups(&self) -> Vec<Vec<Url>> {
        let parse = |s: &String| match Url::parse(s) {
            Ok(url) => Some(url),
            Err(e) => {
                log::warn!("Invalid announce url {}: {}", s, e);
                None
            }
        };
        if let Some(tiers) = &self.announce_list {
            tiers
                .iter()
                .map(|tier| tier.iter().filter_map(parse).collect())
                .filter(|tier: &Vec<Url>| !tier.is_empty())
                .collect()
        } else if let Some(announce) = &self.announce {
            parse(announce).map(|url| vec![vec![url]]).unwrap_or_default()
        } else {
            Vec::new()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub length: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub files: Option<Vec<File>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: u64,
}
