use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use log::debug;

/// Fallback io blocksize when the backing object reports nothing useful.
pub const DEFAULT_IO_BLOCKSIZE: u32 = 512;

/// Positioned, shared-reference reads over a raw device or disk image.
///
/// All offsets are device offsets; the volume offset (for wrapped or
/// partitioned volumes) is applied by the caller. Implementations must be
/// safe to call from multiple threads at once.
pub trait DeviceRead: Send + Sync {
    /// Read at `offset` into `buf`, returning the number of bytes read.
    /// May return fewer bytes than requested; zero means end of device.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Preferred I/O granularity in bytes.
    fn io_blocksize(&self) -> u32 {
        DEFAULT_IO_BLOCKSIZE
    }

    /// Read exactly `buf.len()` bytes at `offset`, retrying short reads.
    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            match self.read_at(buf, offset)? {
                0 => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("short read at device offset {offset}"),
                    ))
                }
                n => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
            }
        }
        Ok(())
    }
}

impl<D: DeviceRead + ?Sized> DeviceRead for Box<D> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        (**self).read_at(buf, offset)
    }

    fn io_blocksize(&self) -> u32 {
        (**self).io_blocksize()
    }
}

/// Read-only file or block-device backend.
pub struct Device {
    file: File,
    io_blocksize: u32,
}

impl Device {
    /// Open the backing object read-only and discover its io blocksize.
    ///
    /// Regular files report the filesystem's preferred block size; device
    /// nodes fall back to 512 (sector granularity).
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let io_blocksize = preferred_blocksize(&file);
        debug!("opened {} (io blocksize {})", path.display(), io_blocksize);
        Ok(Device { file, io_blocksize })
    }
}

#[cfg(unix)]
fn preferred_blocksize(file: &File) -> u32 {
    use std::os::unix::fs::{FileTypeExt, MetadataExt};
    match file.metadata() {
        Ok(meta) if meta.file_type().is_block_device() || meta.file_type().is_char_device() => {
            DEFAULT_IO_BLOCKSIZE
        }
        Ok(meta) if meta.blksize() >= DEFAULT_IO_BLOCKSIZE as u64 => meta.blksize() as u32,
        _ => DEFAULT_IO_BLOCKSIZE,
    }
}

#[cfg(not(unix))]
fn preferred_blocksize(_file: &File) -> u32 {
    DEFAULT_IO_BLOCKSIZE
}

impl DeviceRead for Device {
    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        self.file.read_at(buf, offset)
    }

    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::os::windows::fs::FileExt;
        self.file.seek_read(buf, offset)
    }

    fn io_blocksize(&self) -> u32 {
        self.io_blocksize
    }
}

/// Read-coalescing cache configuration.
#[derive(Debug, Clone, Copy)]
pub struct BlockCacheConfig {
    /// Number of cached small blocks (last-N LRU).
    pub items: usize,
    /// Read-ahead, in blocks, fetched past each missed block.
    pub grace: u32,
}

impl Default for BlockCacheConfig {
    fn default() -> Self {
        BlockCacheConfig { items: 64, grace: 8 }
    }
}

struct CacheSlot {
    offset: u64,
    data: Box<[u8]>,
}

struct CacheState {
    // LRU order: most recently used last.
    slots: Vec<CacheSlot>,
}

/// Bounded read-coalescing layer in front of a device.
///
/// Small reads (at most one cache block) are rounded to block granularity,
/// fetched with `grace` blocks of read-ahead, and kept in a last-N LRU.
/// Larger reads bypass the cache. The observable contract is a
/// byte-for-byte view of the underlying device.
pub struct BlockCache<D> {
    dev: D,
    block_size: u32,
    config: BlockCacheConfig,
    state: Mutex<CacheState>,
}

impl<D: DeviceRead> BlockCache<D> {
    pub fn new(dev: D, config: BlockCacheConfig) -> Self {
        let block_size = dev.io_blocksize().max(DEFAULT_IO_BLOCKSIZE);
        BlockCache {
            dev,
            block_size,
            config,
            state: Mutex::new(CacheState { slots: Vec::new() }),
        }
    }

    pub fn into_inner(self) -> D {
        self.dev
    }

    /// Fetch the block starting at `base`, filling the cache with up to
    /// `grace` blocks of read-ahead on a miss. Returns a copy of the
    /// cached bytes (short at end of device).
    fn fetch_block(&self, state: &mut CacheState, base: u64) -> io::Result<Vec<u8>> {
        if let Some(pos) = state.slots.iter().position(|s| s.offset == base) {
            let slot = state.slots.remove(pos);
            let bytes = slot.data.to_vec();
            state.slots.push(slot);
            return Ok(bytes);
        }

        let bs = self.block_size as usize;
        let span = bs * (1 + self.config.grace as usize);
        let mut buf = vec![0u8; span];
        let mut got = 0usize;
        while got < span {
            match self.dev.read_at(&mut buf[got..], base + got as u64)? {
                0 => break,
                n => got += n,
            }
        }
        buf.truncate(got);

        let mut first = Vec::new();
        for (i, chunk) in buf.chunks(bs).enumerate() {
            if i == 0 {
                first = chunk.to_vec();
            }
            self.insert(state, base + (i * bs) as u64, chunk.to_vec().into_boxed_slice());
        }
        Ok(first)
    }

    fn insert(&self, state: &mut CacheState, offset: u64, data: Box<[u8]>) {
        if let Some(pos) = state.slots.iter().position(|s| s.offset == offset) {
            state.slots.remove(pos);
        }
        if state.slots.len() >= self.config.items.max(1) {
            state.slots.remove(0);
        }
        state.slots.push(CacheSlot { offset, data });
    }
}

impl<D: DeviceRead> DeviceRead for BlockCache<D> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let bs = self.block_size as u64;
        if buf.len() as u64 > bs {
            return self.dev.read_at(buf, offset);
        }

        let mut state = self.state.lock().unwrap();
        let mut copied = 0usize;
        while copied < buf.len() {
            let pos = offset + copied as u64;
            let base = pos - pos % bs;
            let within = (pos - base) as usize;
            let block = self.fetch_block(&mut state, base)?;
            if within >= block.len() {
                break; // end of device
            }
            let n = (buf.len() - copied).min(block.len() - within);
            buf[copied..copied + n].copy_from_slice(&block[within..within + n]);
            copied += n;
        }
        Ok(copied)
    }

    fn io_blocksize(&self) -> u32 {
        self.block_size
    }
}

#[cfg(test)]
pub(crate) struct MemDevice(pub Vec<u8>);

#[cfg(test)]
impl DeviceRead for MemDevice {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let data = &self.0;
        if offset >= data.len() as u64 {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }
}
