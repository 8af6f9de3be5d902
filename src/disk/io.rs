use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::{Error as IoError, ErrorKind},
    os::unix::io::AsRawFd,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use lru::LruCache;
use nix::sys::uio::{pread, pwrite};
use sha1::{Digest, Sha1};
use tokio::{sync::Semaphore, task};

use super::{Command, CommandReceiver, TorrentAlert, TorrentAlertSender};
use crate::{
    conf::DiskConf,
    storage_info::StorageInfo,
    BlockInfo, FileInfo, PieceIndex, TorrentId,
};

/// A block read cache entry is keyed by the block's piece and offset.
type CacheKey = (PieceIndex, u32);

/// The entity that owns the torrents' file handles and executes disk IO off
/// the async executor.
pub(super) struct Disk {
    conf: DiskConf,
    /// Each torrent registered with the disk task has an entry here.
    torrents: HashMap<TorrentId, Arc<TorrentIo>>,
    /// Port on which disk IO commands are received.
    cmd_port: CommandReceiver,
    /// Bounds how many blocking IO operations run at once.
    io_semaphore: Arc<Semaphore>,
}

impl Disk {
    pub(super) fn new(conf: DiskConf, cmd_port: CommandReceiver) -> Self {
        let io_semaphore = Arc::new(Semaphore::new(conf.max_concurrent_writes));
        Self {
            conf,
            torrents: HashMap::new(),
            cmd_port,
            io_semaphore,
        }
    }

    /// Runs the disk task until shutdown.
    pub(super) async fn start(&mut self) {
        log::info!("Starting disk IO event loop");
        while let Some(cmd) = self.cmd_port.recv().await {
            match cmd {
                Command::NewTorrent {
                    id,
                    storage,
                    piece_hashes,
                    allocate_full_file_sizes,
                    queued_writes,
                    queued_reads,
                    alert_chan,
                } => {
                    self.new_torrent(
                        id,
                        storage,
                        piece_hashes,
                        allocate_full_file_sizes,
                        queued_writes,
                        queued_reads,
                        alert_chan,
                    )
                    .await;
                }
                Command::WriteBlock { id, block, data } => {
                    self.write_block(id, block, data);
                }
                Command::ReadBlock { id, block } => {
                    self.read_block(id, block);
                }
                Command::VerifyPiece { id, piece_index } => {
                    self.verify_piece(id, piece_index);
                }
                Command::RemoveTorrent { id } => {
                    log::info!("Removing torrent {} from disk task", id);
                    self.torrents.remove(&id);
                }
                Command::Shutdown => {
                    log::info!("Shutting down disk event loop");
                    break;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn new_torrent(
        &mut self,
        id: TorrentId,
        storage: StorageInfo,
        piece_hashes: Vec<u8>,
        allocate_full_file_sizes: bool,
        queued_writes: Arc<AtomicUsize>,
        queued_reads: Arc<AtomicUsize>,
        alert_chan: TorrentAlertSender,
    ) {
        if self.torrents.contains_key(&id) {
            log::warn!("Torrent {} already allocated", id);
            let _ = alert_chan.send(TorrentAlert::Allocated(Err(
                IoError::new(ErrorKind::AlreadyExists, "torrent allocated"),
            )));
            return;
        }

        // Do _not_ abort the disk task on an allocation failure: it is
        // reported to the torrent and the loop continues.
        let alloc_storage = storage.clone();
        let files = task::spawn_blocking(move || {
            allocate_files(&alloc_storage, allocate_full_file_sizes)
        })
        .await
        .unwrap_or_else(|e| Err(IoError::new(ErrorKind::Other, e)));

        match files {
            Ok(files) => {
                log::info!("Torrent {} successfully allocated", id);
                let torrent = Arc::new(TorrentIo {
                    storage,
                    piece_hashes,
                    files,
                    alert_chan: alert_chan.clone(),
                    queued_writes,
                    queued_reads,
                    read_cache: Mutex::new(LruCache::new(
                        self.conf.read_cache_capacity,
                    )),
                });
                self.torrents.insert(id, torrent);
                let _ = alert_chan.send(TorrentAlert::Allocated(Ok(())));
            }
            Err(e) => {
                log::warn!("Torrent {} allocation failure: {}", id, e);
                let _ = alert_chan.send(TorrentAlert::Allocated(Err(e)));
            }
        }
    }

    fn torrent(&self, id: TorrentId) -> Option<Arc<TorrentIo>> {
        let torrent = self.torrents.get(&id);
        if torrent.is_none() {
            log::warn!("Torrent {} not registered with disk task", id);
        }
        torrent.cloned()
    }

    fn write_block(&self, id: TorrentId, block: BlockInfo, data: Vec<u8>) {
        log::trace!("Saving torrent {} block {:?} to disk", id, block);
        let torrent = match self.torrent(id) {
            Some(torrent) => torrent,
            None => return,
        };
        let semaphore = Arc::clone(&self.io_semaphore);
        task::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let io_torrent = Arc::clone(&torrent);
            let result = task::spawn_blocking(move || {
                io_torrent.write_block(&block, &data)
            })
            .await
            .unwrap_or_else(|e| Err(IoError::new(ErrorKind::Other, e)));

            if let Err(e) = &result {
                log::warn!("Torrent {} block {:?} write error: {}", id, block, e);
            }
            torrent.queued_writes.fetch_sub(1, Ordering::AcqRel);
            let _ = torrent
                .alert_chan
                .send(TorrentAlert::BlockWritten { block, result });
        });
    }

    fn read_block(&self, id: TorrentId, block: BlockInfo) {
        log::trace!("Reading torrent {} block {:?} from disk", id, block);
        let torrent = match self.torrent(id) {
            Some(torrent) => torrent,
            None => return,
        };

        // serve from the read cache if the block is hot
        let cached = torrent
            .read_cache
            .lock()
            .expect("read cache lock poisoned")
            .get(&(block.piece_index, block.offset))
            .cloned();
        if let Some(data) = cached {
            torrent.queued_reads.fetch_sub(1, Ordering::AcqRel);
            let _ = torrent.alert_chan.send(TorrentAlert::BlockRead {
                block,
                result: Ok(data),
            });
            return;
        }

        let semaphore = Arc::clone(&self.io_semaphore);
        task::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let io_torrent = Arc::clone(&torrent);
            let result = task::spawn_blocking(move || {
                io_torrent.read_block(&block)
            })
            .await
            .unwrap_or_else(|e| Err(IoError::new(ErrorKind::Other, e)));

            match &result {
                Ok(data) => {
                    torrent
                        .read_cache
                        .lock()
                        .expect("read cache lock poisoned")
                        .put((block.piece_index, block.offset), data.clone());
                }
                Err(e) => {
                    log::warn!(
                        "Torrent {} block {:?} read error: {}",
                        id,
                        block,
                        e
                    );
                }
            }
            torrent.queued_reads.fetch_sub(1, Ordering::AcqRel);
            let _ = torrent
                .alert_chan
                .send(TorrentAlert::BlockRead { block, result });
        });
    }

    fn verify_piece(&self, id: TorrentId, piece_index: PieceIndex) {
        log::trace!("Verifying torrent {} piece {}", id, piece_index);
        let torrent = match self.torrent(id) {
            Some(torrent) => torrent,
            None => return,
        };
        let semaphore = Arc::clone(&self.io_semaphore);
        task::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let io_torrent = Arc::clone(&torrent);
            // a piece that cannot be read back hashes to nothing: it counts
            // as a mismatch and stays unverified
            let is_valid = task::spawn_blocking(move || {
                io_torrent.piece_matches_hash(piece_index)
            })
            .await
            .unwrap_or(false);

            let _ = torrent.alert_chan.send(TorrentAlert::PieceVerified {
                piece_index,
                is_valid,
            });
        });
    }
}

/// The disk-side state of one torrent.
struct TorrentIo {
    storage: StorageInfo,
    /// The concatenation of all expected piece hashes.
    piece_hashes: Vec<u8>,
    /// Handles of all files in torrent, opened when the torrent is
    /// allocated. Writes take the per-file guard; reads share the handle via
    /// positioned IO but take the guard too so a read never observes a
    /// half-applied overlapping write.
    files: Vec<Mutex<TorrentFile>>,
    /// The channel on which completions are reported to the torrent.
    alert_chan: TorrentAlertSender,
    /// Outstanding write and read operation counts, shared with the
    /// torrent's rate limiter chains as backpressure signals.
    queued_writes: Arc<AtomicUsize>,
    queued_reads: Arc<AtomicUsize>,
    /// Recently served upload blocks.
    read_cache: Mutex<LruCache<CacheKey, Vec<u8>>>,
}

impl TorrentIo {
    /// Writes a block's bytes at its position in the torrent, splitting
    /// across file boundaries where needed.
    fn write_block(
        &self,
        block: &BlockInfo,
        data: &[u8],
    ) -> Result<(), IoError> {
        let offset = self.storage.piece_offset(block.piece_index)
            + block.offset as u64;
        self.for_each_file_slice(offset, data.len() as u64, |file, slice, pos| {
            file.write_all_at(&data[pos..pos + slice.len as usize], slice.offset)
        })
    }

    /// Reads back a block's bytes from their position in the torrent.
    fn read_block(&self, block: &BlockInfo) -> Result<Vec<u8>, IoError> {
        let offset = self.storage.piece_offset(block.piece_index)
            + block.offset as u64;
        self.read_range(offset, block.len as usize)
    }

    /// Reads the piece's bytes back from disk and compares their digest with
    /// the expected piece hash. Any read failure counts as a mismatch.
    fn piece_matches_hash(&self, piece_index: PieceIndex) -> bool {
        let piece_len = match self.storage.piece_len(piece_index) {
            Ok(len) => len,
            Err(_) => return false,
        };
        if let Ok(file_range) =
            self.storage.files_intersecting_piece(piece_index)
        {
            log::trace!("Piece {} spans files {:?}", piece_index, file_range);
        }
        let offset = self.storage.piece_offset(piece_index);
        let bytes = match self.read_range(offset, piece_len as usize) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::debug!(
                    "Piece {} unreadable during verification: {}",
                    piece_index,
                    e
                );
                return false;
            }
        };

        let mut hasher = Sha1::new();
        hasher.update(&bytes);
        let digest = hasher.finalize();

        let hash_pos = piece_index * 20;
        debug_assert!(hash_pos + 20 <= self.piece_hashes.len());
        let expected = &self.piece_hashes[hash_pos..hash_pos + 20];
        let is_valid = digest.as_slice() == expected;
        if is_valid {
            log::debug!("Piece {} hash matches", piece_index);
        } else {
            log::warn!("Piece {} hash mismatch", piece_index);
        }
        is_valid
    }

    fn read_range(
        &self,
        torrent_offset: u64,
        len: usize,
    ) -> Result<Vec<u8>, IoError> {
        let mut buf = vec![0; len];
        self.for_each_file_slice(
            torrent_offset,
            len as u64,
            |file, slice, pos| {
                file.read_all_at(
                    &mut buf[pos..pos + slice.len as usize],
                    slice.offset,
                )
            },
        )?;
        Ok(buf)
    }

    /// Maps the byte range starting at `torrent_offset` onto the files it
    /// intersects and invokes `op` per file with the file slice and the
    /// position of that slice within the range.
    fn for_each_file_slice(
        &self,
        mut torrent_offset: u64,
        len: u64,
        mut op: impl FnMut(
            &TorrentFile,
            crate::storage_info::FileSlice,
            usize,
        ) -> Result<(), IoError>,
    ) -> Result<(), IoError> {
        let file_range = self
            .storage
            .files_intersecting_bytes(torrent_offset..torrent_offset + len);
        if file_range.is_empty() {
            return Err(IoError::new(
                ErrorKind::InvalidInput,
                "byte range outside torrent",
            ));
        }

        let mut pos = 0usize;
        for file in &self.files[file_range] {
            let file = file.lock().expect("file lock poisoned");
            let remaining = len - pos as u64;
            let slice = file.info.slice_from(torrent_offset, remaining);
            debug_assert!(slice.len > 0);
            op(&file, slice, pos)?;
            torrent_offset += slice.len;
            pos += slice.len as usize;
        }

        if pos as u64 != len {
            return Err(IoError::new(
                ErrorKind::InvalidInput,
                "byte range past the last file",
            ));
        }
        Ok(())
    }
}

/// Creates the torrent's directory structure and opens all file handles.
/// Already existing files are opened in place, which is what a resumed
/// download needs.
fn allocate_files(
    storage: &StorageInfo,
    allocate_full_file_sizes: bool,
) -> Result<Vec<Mutex<TorrentFile>>, IoError> {
    fs::create_dir_all(&storage.download_dir)?;

    let mut files = Vec::with_capacity(storage.files.len());
    for file in &storage.files {
        debug_assert!(!file.path.is_absolute());
        let path = storage.download_dir.join(&file.path);
        if let Some(subdir) = path.parent() {
            if !subdir.exists() {
                log::debug!("Creating torrent subdir {:?}", subdir);
                fs::create_dir_all(subdir)?;
            }
        }

        let handle = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                log::warn!("Failed to open file {:?}: {}", path, e);
                e
            })?;
        if allocate_full_file_sizes {
            // zero-filled (sparse where the file system supports it)
            handle.set_len(file.len)?;
        }

        files.push(Mutex::new(TorrentFile {
            info: FileInfo {
                path,
                torrent_offset: file.torrent_offset,
                len: file.len,
            },
            handle,
        }));
    }
    Ok(files)
}

struct TorrentFile {
    info: FileInfo,
    handle: File,
}

impl TorrentFile {
    /// Writes the whole buffer at the offset. IO syscalls are not guaranteed
    /// to move the whole buffer in one go, so this loops until every byte is
    /// confirmed written or an error occurs.
    fn write_all_at(
        &self,
        mut buf: &[u8],
        mut offset: u64,
    ) -> Result<(), IoError> {
        while !buf.is_empty() {
            let write_count =
                pwrite(self.handle.as_raw_fd(), buf, offset as i64)
                    .map_err(nix_to_io)?;
            if write_count == 0 {
                return Err(IoError::new(
                    ErrorKind::WriteZero,
                    "file refused further bytes",
                ));
            }
            buf = &buf[write_count..];
            offset += write_count as u64;
        }
        Ok(())
    }

    /// Fills the whole buffer from the offset, looping like `write_all_at`.
    /// Hitting end of file early is an error: the caller asked for bytes
    /// that were never written.
    fn read_all_at(
        &self,
        mut buf: &mut [u8],
        mut offset: u64,
    ) -> Result<(), IoError> {
        while !buf.is_empty() {
            let read_count = pread(self.handle.as_raw_fd(), buf, offset as i64)
                .map_err(nix_to_io)?;
            if read_count == 0 {
                return Err(IoError::new(
                    ErrorKind::UnexpectedEof,
                    "file ended before the requested range",
                ));
            }
            buf = &mut buf[read_count..];
            offset += read_count as u64;
        }
        Ok(())
    }
}

fn nix_to_io(e: nix::Error) -> IoError {
    match e.as_errno() {
        Some(errno) => IoError::from_raw_os_error(errno as i32),
        None => IoError::new(ErrorKind::Other, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio::sync::mpsc;

    // A scratch directory unique to the test, cleaned up on drop.
    struct Scratch(PathBuf);

    impl Scratch {
        fn new(tag: &str) -> Self {
            let dir = std::env::temp_dir().join(format!(
                "swarmtorrent-test-{}-{}",
                std::process::id(),
                tag
            ));
            let _ = fs::remove_dir_all(&dir);
            Self(dir)
        }
    }

    impl Drop for Scratch {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }

    fn two_file_storage(download_dir: PathBuf) -> StorageInfo {
        // 2 pieces of 16 bytes over two files split at byte 10
        StorageInfo {
            piece_count: 2,
            piece_len: 16,
            last_piece_len: 16,
            download_len: 32,
            download_dir,
            files: vec![
                FileInfo {
                    path: PathBuf::from("a"),
                    torrent_offset: 0,
                    len: 10,
                },
                FileInfo {
                    path: PathBuf::from("sub").join("b"),
                    torrent_offset: 10,
                    len: 22,
                },
            ],
        }
    }

    fn test_torrent_io(storage: StorageInfo, piece_hashes: Vec<u8>) -> TorrentIo {
        let files = allocate_files(&storage, true).unwrap();
        let (alert_chan, _alert_port) = mpsc::unbounded_channel();
        TorrentIo {
            storage,
            piece_hashes,
            files,
            alert_chan,
            queued_writes: Arc::new(AtomicUsize::new(0)),
            queued_reads: Arc::new(AtomicUsize::new(0)),
            read_cache: Mutex::new(LruCache::new(8)),
        }
    }

    #[test]
    fn test_write_read_round_trip_across_files() {
        let scratch = Scratch::new("round-trip");
        let torrent = test_torrent_io(two_file_storage(scratch.0.clone()), vec![]);

        // piece 0 spans the file boundary at byte 10
        let block = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: 16,
        };
        let data: Vec<u8> = (0..16).collect();
        torrent.write_block(&block, &data).unwrap();

        assert_eq!(torrent.read_block(&block).unwrap(), data);
        // the split bytes landed in the right files
        assert_eq!(
            fs::read(scratch.0.join("a")).unwrap(),
            (0..10).collect::<Vec<u8>>()
        );
        assert_eq!(
            fs::read(scratch.0.join("sub").join("b")).unwrap()[..6],
            (10..16).collect::<Vec<u8>>()[..]
        );
    }

    #[test]
    fn test_verification_over_written_piece() {
        let scratch = Scratch::new("verify");
        let piece: Vec<u8> = (0..16).map(|byte| byte ^ 0x5a).collect();
        let mut piece_hashes = Sha1::digest(&piece).to_vec();
        // piece 1 goes unwritten; give it an arbitrary expected hash
        piece_hashes.extend_from_slice(&[0; 20]);

        let torrent =
            test_torrent_io(two_file_storage(scratch.0.clone()), piece_hashes);
        torrent
            .write_block(
                &BlockInfo {
                    piece_index: 0,
                    offset: 0,
                    len: 16,
                },
                &piece,
            )
            .unwrap();

        assert!(torrent.piece_matches_hash(0));
        // piece 1 is zero-filled by allocation and cannot match
        assert!(!torrent.piece_matches_hash(1));
    }

    #[test]
    fn test_unallocated_read_fails_without_full_allocation() {
        let scratch = Scratch::new("eof");
        let storage = two_file_storage(scratch.0.clone());
        let files = allocate_files(&storage, false).unwrap();
        let (alert_chan, _alert_port) = mpsc::unbounded_channel();
        let torrent = TorrentIo {
            storage,
            piece_hashes: vec![0; 40],
            files,
            alert_chan,
            queued_writes: Arc::new(AtomicUsize::new(0)),
            queued_reads: Arc::new(AtomicUsize::new(0)),
            read_cache: Mutex::new(LruCache::new(8)),
        };

        // nothing has been written and the files were created empty
        let block = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: 16,
        };
        assert!(torrent.read_block(&block).is_err());
        // which also means verification must report a mismatch
        assert!(!torrent.piece_matches_hash(0));
    }

    #[test]
    fn test_out_of_bounds_range_is_rejected() {
        let scratch = Scratch::new("bounds");
        let torrent =
            test_torrent_io(two_file_storage(scratch.0.clone()), vec![]);
        let block = BlockInfo {
            piece_index: 1,
            offset: 16,
            len: 16,
        };
        assert!(torrent.read_block(&block).is_err());
    }
}
