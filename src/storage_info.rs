//! How the torrent's flat byte stream maps onto the files on disk.
//!
//! Pieces and blocks address the torrent as one contiguous run of bytes;
//! the disk backend needs to know which file, and where within it, a given
//! range of that run lives. The file list is ordered by torrent offset and
//! gapless, so any byte range maps to one contiguous run of files.

use std::{ops::Range, path::PathBuf};

use crate::{error::*, metainfo::Metainfo, FileIndex, PieceIndex};

/// One file of the torrent.
#[derive(Clone, Debug, PartialEq)]
pub struct FileInfo {
    /// Where the file lives, relative to the download directory.
    pub path: PathBuf,
    /// The file's length, in bytes.
    pub len: u64,
    /// Where the file's first byte sits in the torrent's byte stream: the
    /// first file starts at 0 and every further file starts where the one
    /// before it ended.
    pub torrent_offset: u64,
}

impl FileInfo {
    /// The half-open range of torrent bytes this file covers.
    pub(crate) fn byte_range(&self) -> Range<u64> {
        self.torrent_offset..self.torrent_offset + self.len
    }

    /// Maps a byte range of the torrent onto this file: where in the file
    /// it starts and how much of it fits. A range reaching past the file's
    /// end is clipped, the remainder belongs to the files after this one.
    ///
    /// # Panics
    ///
    /// `torrent_offset` must fall inside this file.
    pub(crate) fn slice_from(
        &self,
        torrent_offset: u64,
        len: u64,
    ) -> FileSlice {
        assert!(
            self.byte_range().contains(&torrent_offset),
            "torrent offset {} outside file {:?}",
            torrent_offset,
            self.path,
        );
        let offset = torrent_offset - self.torrent_offset;
        FileSlice {
            offset,
            len: len.min(self.len - offset),
        }
    }
}

/// A byte range within one file, in file-relative coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct FileSlice {
    /// The range's start, relative to the file's first byte.
    pub offset: u64,
    /// The range's length in bytes.
    pub len: u64,
}

/// The torrent's storage geometry: piece sizes, the total length, the
/// download directory and the ordered file list.
#[derive(Clone, Debug)]
pub(crate) struct StorageInfo {
    pub piece_count: usize,
    /// The nominal piece length, shared by every piece but possibly the
    /// last.
    pub piece_len: u32,
    /// The final piece's length, shorter than `piece_len` whenever the
    /// torrent's size is not an exact multiple of it.
    pub last_piece_len: u32,
    /// The size of the whole download: the sum of all file lengths.
    pub download_len: u64,
    /// Where the torrent's files are placed. A single file lands directly
    /// in here; a multi file torrent gets a subdirectory named after
    /// itself, so its entries don't scatter across the download root.
    pub download_dir: PathBuf,
    /// The files in torrent order: contiguous, non-overlapping offsets
    /// whose lengths add up to `download_len`.
    pub files: Vec<FileInfo>,
}

impl StorageInfo {
    /// Derives the storage geometry from the metainfo.
    pub fn new(metainfo: &Metainfo, download_dir: PathBuf) -> Self {
        let piece_count = metainfo.piece_count();
        let piece_len = metainfo.piece_len();
        let download_len = metainfo.total_len();
        // whatever the full length pieces leave over is the final piece
        let last_piece_len = (download_len
            - (piece_count as u64 - 1) * piece_len as u64)
            as u32;

        let download_dir = if metainfo.is_multi_file() {
            download_dir.join(metainfo.name())
        } else {
            download_dir
        };

        Self {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            download_dir,
            files: metainfo.files(),
        }
    }

    /// The length of the piece at `index`, or an error for an index past
    /// the last piece.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if index + 1 < self.piece_count {
            Ok(self.piece_len)
        } else if index + 1 == self.piece_count {
            Ok(self.last_piece_len)
        } else {
            log::error!(
                "No piece {} in a {} piece torrent",
                index,
                self.piece_count
            );
            Err(Error::InvalidPieceIndex(index))
        }
    }

    /// Where the piece's first byte sits in the torrent's byte stream.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * self.piece_len as u64
    }

    /// The run of files the piece's bytes live in.
    pub fn files_intersecting_piece(
        &self,
        index: PieceIndex,
    ) -> Result<Range<FileIndex>> {
        let piece_offset = self.piece_offset(index);
        let piece_end = piece_offset + self.piece_len(index)? as u64;
        Ok(self.files_intersecting_bytes(piece_offset..piece_end))
    }

    /// The run of files a half-open torrent byte range touches. As the file
    /// list is ordered and gapless this is always a single contiguous index
    /// range; a byte range outside the torrent yields an empty one.
    pub fn files_intersecting_bytes(
        &self,
        byte_range: Range<u64>,
    ) -> Range<FileIndex> {
        let first = match self
            .files
            .iter()
            .position(|file| file.byte_range().contains(&byte_range.start))
        {
            Some(first) => first,
            None => return 0..0,
        };
        // extend the run over every further file starting before the byte
        // range ends
        let mut one_past_last = first + 1;
        while one_past_last < self.files.len()
            && self.files[one_past_last].torrent_offset < byte_range.end
        {
            one_past_last += 1;
        }
        first..one_past_last
    }
}
