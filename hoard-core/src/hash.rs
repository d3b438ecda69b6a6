//! Content hashing
//!
//! Files are hashed in fixed-size chunks so memory use stays bounded no
//! matter how large the input is. `md5-dos2unix` normalizes CRLF to LF in
//! chunks that look like text before digesting them.

use md5::Digest;
use std::fmt;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use crate::error::{Error, Result};
use crate::fs::{FileInfo, FileSystem};
use crate::hash_info::{HASH_DIR_SUFFIX, HashInfo};
use crate::meta::Meta;
use crate::state::StateCache;

pub const DEFAULT_ALGORITHM: &str = "md5";

/// Read size used while streaming
pub const CHUNK_SIZE: usize = 1 << 20;

/// Leading bytes of a chunk inspected by the text heuristic
pub const TEXT_BLOCK_SIZE: usize = 512;

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Md5,
    Md5Dos2Unix,
    Sha256,
    Blake3,
}

impl Algorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Md5 => "md5",
            Algorithm::Md5Dos2Unix => "md5-dos2unix",
            Algorithm::Sha256 => "sha256",
            Algorithm::Blake3 => "blake3",
        }
    }

    pub fn hasher(&self) -> Hasher {
        let digest = match self {
            Algorithm::Md5 | Algorithm::Md5Dos2Unix => DigestState::Md5(md5::Md5::new()),
            Algorithm::Sha256 => DigestState::Sha256(sha2::Sha256::new()),
            Algorithm::Blake3 => DigestState::Blake3(Box::new(blake3::Hasher::new())),
        };
        Hasher {
            digest,
            dos2unix: matches!(self, Algorithm::Md5Dos2Unix),
            pending_cr: false,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(Algorithm::Md5),
            "md5-dos2unix" => Ok(Algorithm::Md5Dos2Unix),
            "sha256" => Ok(Algorithm::Sha256),
            "blake3" => Ok(Algorithm::Blake3),
            other => Err(Error::NotSupported(format!("hash algorithm '{}'", other))),
        }
    }
}

#[derive(Clone)]
enum DigestState {
    Md5(md5::Md5),
    Sha256(sha2::Sha256),
    Blake3(Box<blake3::Hasher>),
}

/// Incremental digest
#[derive(Clone)]
pub struct Hasher {
    digest: DigestState,
    dos2unix: bool,
    /// A text chunk ended in `\r`; held back until the next byte is known
    pending_cr: bool,
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hasher")
            .field("dos2unix", &self.dos2unix)
            .finish_non_exhaustive()
    }
}

impl Hasher {
    fn feed(&mut self, data: &[u8]) {
        match &mut self.digest {
            DigestState::Md5(h) => h.update(data),
            DigestState::Sha256(h) => h.update(data),
            DigestState::Blake3(h) => {
                h.update(data);
            }
        }
    }

    /// Add one chunk. In dos2unix mode the text check is made per call.
    pub fn update(&mut self, chunk: &[u8]) {
        if !self.dos2unix {
            self.feed(chunk);
            return;
        }
        if chunk.is_empty() {
            return;
        }
        if !istextblock(&chunk[..chunk.len().min(TEXT_BLOCK_SIZE)]) {
            if std::mem::take(&mut self.pending_cr) {
                self.feed(b"\r");
            }
            self.feed(chunk);
            return;
        }

        let mut chunk = chunk;
        if std::mem::take(&mut self.pending_cr) {
            if chunk[0] == b'\n' {
                self.feed(b"\n");
                chunk = &chunk[1..];
            } else {
                self.feed(b"\r");
            }
        }
        let (body, trailing_cr) = match chunk.strip_suffix(b"\r") {
            Some(body) => (body, true),
            None => (chunk, false),
        };
        let normalized = dos2unix(body);
        self.feed(&normalized);
        self.pending_cr = trailing_cr;
    }

    /// Hex digest of everything fed so far
    pub fn hex_digest(&self) -> String {
        let mut this = self.clone();
        if std::mem::take(&mut this.pending_cr) {
            this.feed(b"\r");
        }
        match this.digest {
            DigestState::Md5(h) => hex::encode(h.finalize()),
            DigestState::Sha256(h) => hex::encode(h.finalize()),
            DigestState::Blake3(h) => h.finalize().to_hex().to_string(),
        }
    }
}

/// Replace every CRLF with LF
pub fn dos2unix(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter().peekable();
    while let Some(&b) = iter.next() {
        if b == b'\r' && iter.peek() == Some(&&b'\n') {
            continue;
        }
        out.push(b);
    }
    out
}

fn is_text_char(b: u8) -> bool {
    (32..127).contains(&b) || matches!(b, b'\n' | b'\r' | b'\t' | 0x0c | 0x08)
}

/// Heuristic: empty is text, NUL is binary, otherwise at most 30% non-text bytes
pub fn istextblock(block: &[u8]) -> bool {
    if block.is_empty() {
        return true;
    }
    if block.contains(&0) {
        return false;
    }
    let nontext = block.iter().filter(|&&b| !is_text_char(b)).count();
    (nontext as f64) / (block.len() as f64) <= 0.30
}

/// Fill `buf` as far as the reader allows; returns bytes read
async fn read_chunk<R: AsyncRead + Unpin + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Hash a stream; returns the hex digest and the number of bytes read
pub async fn hash_stream<R: AsyncRead + Unpin + ?Sized>(reader: &mut R, algorithm: Algorithm) -> io::Result<(String, u64)> {
    let mut hasher = algorithm.hasher();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = read_chunk(reader, &mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hasher.hex_digest(), total))
}

/// Hash in-memory bytes, chunked the same way as a stream
pub fn hash_bytes(data: &[u8], algorithm: Algorithm) -> String {
    let mut hasher = algorithm.hasher();
    for chunk in data.chunks(CHUNK_SIZE) {
        hasher.update(chunk);
    }
    hasher.hex_digest()
}

/// Hash the contents of `path` on `fs`
pub async fn file_hash(fs: &dyn FileSystem, path: &Path, algorithm: Algorithm) -> Result<String> {
    let mut reader = fs.open(path).await.map_err(|e| Error::from_io(e, path))?;
    let (value, _) = hash_stream(&mut reader, algorithm).await?;
    Ok(value)
}

/// Handle to the digest of a [`HashingReader`] that outlives the reader
#[derive(Debug, Clone)]
pub struct HashHandle {
    hasher: Arc<Mutex<Hasher>>,
    total_read: Arc<Mutex<u64>>,
}

impl HashHandle {
    pub fn hex_digest(&self) -> String {
        self.hasher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .hex_digest()
    }

    pub fn total_read(&self) -> u64 {
        *self.total_read.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Reader that hashes everything passing through it.
///
/// Chunk boundaries follow the consumer's reads, so this is meant for
/// algorithms whose digest does not depend on chunking.
#[derive(Debug)]
pub struct HashingReader<R> {
    inner: R,
    handle: HashHandle,
}

impl<R: AsyncRead + Unpin> HashingReader<R> {
    pub fn new(inner: R, algorithm: Algorithm) -> (Self, HashHandle) {
        let handle = HashHandle {
            hasher: Arc::new(Mutex::new(algorithm.hasher())),
            total_read: Arc::new(Mutex::new(0)),
        };
        (
            Self {
                inner,
                handle: handle.clone(),
            },
            handle,
        )
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let new = &buf.filled()[before..];
        if !new.is_empty() {
            this.handle
                .hasher
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .update(new);
            *this.handle.total_read.lock().unwrap_or_else(|e| e.into_inner()) += new.len() as u64;
        }
        Poll::Ready(Ok(()))
    }
}

/// Backend-reported value for `name`, if the file info carries one
fn native_value(meta: &Meta, name: &str) -> Option<String> {
    let value = match name {
        "md5" => meta.md5.as_ref(),
        "etag" => meta.etag.as_ref(),
        "checksum" => meta.checksum.as_ref(),
        _ => None,
    }?;
    if value.is_empty() || value.ends_with(HASH_DIR_SUFFIX) {
        return None;
    }
    Some(value.clone())
}

/// Hash one file without consulting the state cache
pub async fn hash_file_uncached(path: &Path, fs: &dyn FileSystem, name: &str, info: &FileInfo) -> Result<(Meta, HashInfo)> {
    let meta = Meta::from_info(info);
    if let Some(value) = native_value(&meta, name) {
        return Ok((meta, HashInfo::native(name, value)));
    }
    let algorithm: Algorithm = name.parse()?;
    if info.is_symlink && info.kind == crate::fs::FileKind::BrokenLink {
        return Err(Error::NotFound(path.display().to_string()));
    }
    let value = file_hash(fs, path, algorithm).await?;
    Ok((meta, HashInfo::new(name, value)))
}

/// Hash one file, going through `state` when it is given
pub async fn hash_file(
    path: &Path,
    fs: &dyn FileSystem,
    name: &str,
    state: Option<&dyn StateCache>,
    info: Option<FileInfo>,
) -> Result<(Meta, HashInfo)> {
    let info = match info {
        Some(info) => info,
        None => fs.info(path).await.map_err(|e| Error::from_io(e, path))?,
    };

    if let Some(state) = state {
        if let Some((meta, hash_info)) = state.get(path, fs, &info)? {
            if hash_info.name == name {
                return Ok((meta, hash_info));
            }
        }
    }

    let (meta, hash_info) = hash_file_uncached(path, fs, name, &info).await?;
    if let Some(state) = state {
        state.save(path, fs, &hash_info, &info)?;
    }
    Ok((meta, hash_info))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFileSystem;
    use bytes::Bytes;

    const HELLO_MD5: &str = "5d41402abc4b2a76b9719d911017c592";

    #[test]
    fn test_known_digests() {
        assert_eq!(hash_bytes(b"hello", Algorithm::Md5), HELLO_MD5);
        assert_eq!(
            hash_bytes(b"hello", Algorithm::Sha256),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(
            hash_bytes(b"hello", Algorithm::Blake3),
            blake3::hash(b"hello").to_hex().to_string()
        );
    }

    #[test]
    fn test_unknown_algorithm() {
        let err = "crc32".parse::<Algorithm>().unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[test]
    fn test_dos2unix_only_for_text() {
        assert_eq!(
            hash_bytes(b"a\r\nb\r\n", Algorithm::Md5Dos2Unix),
            hash_bytes(b"a\nb\n", Algorithm::Md5)
        );
        let binary = b"\x00\r\n\x01";
        assert_eq!(
            hash_bytes(binary, Algorithm::Md5Dos2Unix),
            hash_bytes(binary, Algorithm::Md5)
        );
    }

    #[test]
    fn test_dos2unix_crlf_split_across_chunks() {
        let mut split = Algorithm::Md5Dos2Unix.hasher();
        split.update(b"line one\r");
        split.update(b"\nline two");
        assert_eq!(split.hex_digest(), hash_bytes(b"line one\nline two", Algorithm::Md5));

        let mut lone = Algorithm::Md5Dos2Unix.hasher();
        lone.update(b"ends with cr\r");
        assert_eq!(lone.hex_digest(), hash_bytes(b"ends with cr\r", Algorithm::Md5));
    }

    #[test]
    fn test_istextblock() {
        assert!(istextblock(b""));
        assert!(istextblock(b"plain text\n"));
        assert!(!istextblock(b"nul\x00inside"));
        assert!(!istextblock(&[0xff; 10]));
    }

    #[tokio::test]
    async fn test_hash_stream_counts_bytes() {
        let data = vec![7u8; CHUNK_SIZE + 3];
        let mut cursor = io::Cursor::new(data.clone());
        let (value, total) = hash_stream(&mut cursor, Algorithm::Md5).await.unwrap();
        assert_eq!(total, data.len() as u64);
        assert_eq!(value, hash_bytes(&data, Algorithm::Md5));
    }

    #[tokio::test]
    async fn test_hashing_reader() {
        let (mut reader, handle) = HashingReader::new(io::Cursor::new(b"hello".to_vec()), Algorithm::Md5);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
        assert_eq!(handle.hex_digest(), HELLO_MD5);
        assert_eq!(handle.total_read(), 5);
    }

    #[tokio::test]
    async fn test_native_checksum_is_reused() {
        let fs = MemoryFileSystem::new();
        let path = Path::new("/f");
        fs.insert(path, Bytes::from_static(b"hello"));
        let mut info = FileInfo::file(5);
        info.md5 = Some("feedface".to_string());

        let (_, hi) = hash_file(path, &fs, "md5", None, Some(info)).await.unwrap();
        assert_eq!(hi.value.as_deref(), Some("feedface"));
        assert!(hi.native);

        let (_, hi) = hash_file(path, &fs, "md5", None, None).await.unwrap();
        assert_eq!(hi.value.as_deref(), Some(HELLO_MD5));
        assert!(!hi.native);
    }
}
