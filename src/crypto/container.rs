//! Container layout: an ordered run of frames followed by the key salt.
//!
//! ```text
//! [frame_0][frame_1]...[frame_n][salt (KEY_SIZE bytes)]
//! ```
//!
//! Every frame is `FRAME_SIZE` bytes except the last, which is clamped to
//! whatever remains before the salt. Readers fetch the salt first, derive
//! the key, then pull frames by byte range.

use super::{
    BUFFER_SIZE, ChunkKey, CryptoError, CryptoResult, FRAME_OVERHEAD, FRAME_SIZE, KEY_SIZE,
    KdfParams, NonceSequence, decrypt_chunk, derive_key, encrypt_chunk, generate_salt,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt, stream};
use secrecy::SecretString;
use std::ops::Range;

/// Number of chunks a plaintext of `plaintext_len` bytes encrypts into.
pub fn chunk_count_for(plaintext_len: u64) -> u64 {
    plaintext_len.div_ceil(BUFFER_SIZE as u64).max(1)
}

/// Total container length for a plaintext of `plaintext_len` bytes.
pub fn container_len_for(plaintext_len: u64) -> u64 {
    plaintext_len + chunk_count_for(plaintext_len) * FRAME_OVERHEAD as u64 + KEY_SIZE as u64
}

/// Byte boundaries of a container of known total length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerLayout {
    total_len: u64,
}

impl ContainerLayout {
    pub fn new(total_len: u64) -> CryptoResult<Self> {
        let min_len = (KEY_SIZE + FRAME_OVERHEAD) as u64;
        if total_len < min_len {
            return Err(CryptoError::InvalidContainer(format!(
                "{total_len} bytes is shorter than the minimum of {min_len}"
            )));
        }

        let remainder = (total_len - KEY_SIZE as u64) % FRAME_SIZE as u64;
        if remainder != 0 && remainder < FRAME_OVERHEAD as u64 {
            return Err(CryptoError::InvalidContainer(format!(
                "final frame of {remainder} bytes cannot hold a nonce and tag"
            )));
        }

        Ok(Self { total_len })
    }

    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    /// Length of the frame region (everything before the salt).
    pub fn payload_len(&self) -> u64 {
        self.total_len - KEY_SIZE as u64
    }

    pub fn salt_range(&self) -> Range<u64> {
        self.payload_len()..self.total_len
    }

    pub fn chunk_count(&self) -> u64 {
        self.payload_len().div_ceil(FRAME_SIZE as u64)
    }

    /// Half-open byte range of frame `index`, or `None` past the end.
    pub fn chunk_range(&self, index: u64) -> Option<Range<u64>> {
        if index >= self.chunk_count() {
            return None;
        }
        let start = index * FRAME_SIZE as u64;
        let end = (start + FRAME_SIZE as u64).min(self.payload_len());
        Some(start..end)
    }

    pub fn is_last(&self, index: u64) -> bool {
        index + 1 == self.chunk_count()
    }
}

/// Incremental container encoder.
///
/// Holds at most one chunk of plaintext; a full buffer is only sealed once
/// more input arrives, so the final frame is always produced by `finish`.
pub struct ContainerWriter {
    key: ChunkKey,
    salt: [u8; KEY_SIZE],
    nonces: NonceSequence,
    pending: Vec<u8>,
}

impl ContainerWriter {
    /// Start a container under a fresh random salt.
    pub fn new(passphrase: &SecretString, params: &KdfParams) -> CryptoResult<Self> {
        Self::with_salt(passphrase, generate_salt(), params)
    }

    pub fn with_salt(
        passphrase: &SecretString,
        salt: [u8; KEY_SIZE],
        params: &KdfParams,
    ) -> CryptoResult<Self> {
        let key = derive_key(passphrase, &salt, params)?;
        Ok(Self {
            key,
            salt,
            nonces: NonceSequence::random(),
            pending: Vec::with_capacity(BUFFER_SIZE),
        })
    }

    pub fn salt(&self) -> &[u8; KEY_SIZE] {
        &self.salt
    }

    /// Buffer `data`, returning every frame completed by it.
    pub fn write(&mut self, mut data: &[u8]) -> CryptoResult<Vec<Vec<u8>>> {
        let mut frames = Vec::new();
        while !data.is_empty() {
            if self.pending.len() == BUFFER_SIZE {
                frames.push(self.seal_pending()?);
            }
            let take = (BUFFER_SIZE - self.pending.len()).min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];
        }
        Ok(frames)
    }

    /// Seal the final frame and append the salt.
    pub fn finish(mut self) -> CryptoResult<Vec<u8>> {
        let mut tail = self.seal_pending()?;
        tail.extend_from_slice(&self.salt);
        Ok(tail)
    }

    fn seal_pending(&mut self) -> CryptoResult<Vec<u8>> {
        let nonce = self.nonces.next_nonce();
        let frame = encrypt_chunk(&self.key, &nonce, &self.pending)?;
        self.pending.clear();
        Ok(frame)
    }
}

/// Splits a plaintext into the `BUFFER_SIZE` pieces a writer seals.
///
/// Always yields at least one (possibly empty) piece, matching
/// [`chunk_count_for`].
pub struct ChunkSplitter<'a> {
    rest: &'a [u8],
    started: bool,
}

impl<'a> ChunkSplitter<'a> {
    pub fn new(plaintext: &'a [u8]) -> Self {
        Self {
            rest: plaintext,
            started: false,
        }
    }
}

impl<'a> Iterator for ChunkSplitter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.started && self.rest.is_empty() {
            return None;
        }
        self.started = true;
        let take = self.rest.len().min(BUFFER_SIZE);
        let (piece, rest) = self.rest.split_at(take);
        self.rest = rest;
        Some(piece)
    }
}

/// Anything that can serve byte ranges of a stored container.
#[async_trait]
pub trait RangeSource: Send + Sync {
    type Error: From<CryptoError> + Send;

    /// Read the half-open range `range`.
    async fn read_range(&self, range: Range<u64>) -> Result<Bytes, Self::Error>;
}

/// Sequential or bounded-parallel decoder over a [`RangeSource`].
pub struct ContainerReader<S> {
    source: S,
    layout: ContainerLayout,
    key: ChunkKey,
}

impl<S: RangeSource> ContainerReader<S> {
    /// Fetch the trailing salt and derive the key.
    pub async fn open(
        source: S,
        total_len: u64,
        passphrase: &SecretString,
        params: &KdfParams,
    ) -> Result<Self, S::Error> {
        let layout = ContainerLayout::new(total_len)?;
        let salt = source.read_range(layout.salt_range()).await?;
        if salt.len() != KEY_SIZE {
            return Err(CryptoError::InvalidContainer(format!(
                "expected a {KEY_SIZE} byte salt, read {}",
                salt.len()
            ))
            .into());
        }
        let key = derive_key(passphrase, &salt, params)?;
        Ok(Self {
            source,
            layout,
            key,
        })
    }

    pub fn layout(&self) -> &ContainerLayout {
        &self.layout
    }

    /// Fetch and authenticate chunk `index`.
    pub async fn read_chunk(&self, index: u64) -> Result<Vec<u8>, S::Error> {
        let range = self.layout.chunk_range(index).ok_or_else(|| {
            CryptoError::InvalidContainer(format!(
                "chunk {index} out of range (container has {})",
                self.layout.chunk_count()
            ))
        })?;
        let expected = (range.end - range.start) as usize;
        let frame = self.source.read_range(range).await?;
        if frame.len() != expected {
            return Err(CryptoError::AuthenticationFailure.into());
        }
        let (plaintext, consumed) = decrypt_chunk(&self.key, &frame)?;
        if consumed != expected {
            return Err(CryptoError::AuthenticationFailure.into());
        }
        Ok(plaintext)
    }

    /// Plaintext chunks in index order, fetching up to `parallelism` at once.
    pub fn chunks(
        &self,
        parallelism: usize,
    ) -> impl Stream<Item = Result<Vec<u8>, S::Error>> + '_ {
        stream::iter(0..self.layout.chunk_count())
            .map(move |index| self.read_chunk(index))
            .buffered(parallelism.max(1))
    }

    /// Decode the whole container into memory.
    pub async fn read_all(&self, parallelism: usize) -> Result<Vec<u8>, S::Error> {
        let chunks: Vec<Vec<u8>> = self.chunks(parallelism).try_collect().await?;
        Ok(chunks.concat())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{NONCE_SIZE, test_kdf_params};
    use std::sync::Mutex;

    /// In-memory container that records every range it serves.
    struct MemorySource {
        data: Vec<u8>,
        reads: Mutex<Vec<Range<u64>>>,
    }

    impl MemorySource {
        fn new(data: Vec<u8>) -> Self {
            Self {
                data,
                reads: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl<'a> RangeSource for &'a MemorySource {
        type Error = CryptoError;

        async fn read_range(&self, range: Range<u64>) -> Result<Bytes, CryptoError> {
            self.reads.lock().unwrap().push(range.clone());
            let end = (range.end as usize).min(self.data.len());
            Ok(Bytes::copy_from_slice(&self.data[range.start as usize..end]))
        }
    }

    fn encode(plaintext: &[u8]) -> Vec<u8> {
        let passphrase = SecretString::from("hunter2");
        let mut writer = ContainerWriter::new(&passphrase, &test_kdf_params()).unwrap();
        let mut out = Vec::new();
        for piece in plaintext.chunks(1024 * 1024 + 7) {
            for frame in writer.write(piece).unwrap() {
                out.extend_from_slice(&frame);
            }
        }
        out.extend_from_slice(&writer.finish().unwrap());
        out
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_layout_boundaries() {
        let plaintext_len = 2 * BUFFER_SIZE as u64 + 10;
        let layout = ContainerLayout::new(container_len_for(plaintext_len)).unwrap();

        assert_eq!(layout.chunk_count(), 3);
        assert_eq!(layout.chunk_range(0), Some(0..FRAME_SIZE as u64));
        assert_eq!(
            layout.chunk_range(2),
            Some(2 * FRAME_SIZE as u64..2 * FRAME_SIZE as u64 + 10 + FRAME_OVERHEAD as u64)
        );
        assert_eq!(layout.chunk_range(3), None);
        assert!(layout.is_last(2));
        assert!(!layout.is_last(1));
        assert_eq!(layout.salt_range().end - layout.salt_range().start, KEY_SIZE as u64);
    }

    #[test]
    fn test_layout_rejects_impossible_lengths() {
        assert!(ContainerLayout::new(KEY_SIZE as u64).is_err());
        assert!(ContainerLayout::new((FRAME_SIZE + KEY_SIZE + NONCE_SIZE) as u64).is_err());
    }

    #[test]
    fn test_chunk_count_matches_writer_output() {
        for len in [0usize, 10, BUFFER_SIZE, BUFFER_SIZE + 1, 2 * BUFFER_SIZE] {
            let encoded = encode(&sample(len));
            assert_eq!(encoded.len() as u64, container_len_for(len as u64));
            let layout = ContainerLayout::new(encoded.len() as u64).unwrap();
            assert_eq!(layout.chunk_count(), chunk_count_for(len as u64));
        }
    }

    #[test]
    fn test_splitter_agrees_with_chunk_count() {
        for len in [0usize, 1, BUFFER_SIZE, BUFFER_SIZE + 1, 3 * BUFFER_SIZE - 1] {
            let data = vec![0u8; len];
            let pieces: Vec<&[u8]> = ChunkSplitter::new(&data).collect();
            assert_eq!(pieces.len() as u64, chunk_count_for(len as u64));
            assert_eq!(pieces.iter().map(|p| p.len()).sum::<usize>(), len);
            assert!(pieces.iter().all(|p| p.len() <= BUFFER_SIZE));
        }
    }

    #[tokio::test]
    async fn test_reader_decodes_writer_output() {
        let plaintext = sample(2 * BUFFER_SIZE + 12345);
        let source = MemorySource::new(encode(&plaintext));
        let passphrase = SecretString::from("hunter2");

        let reader = ContainerReader::open(
            &source,
            source.data.len() as u64,
            &passphrase,
            &test_kdf_params(),
        )
        .await
        .unwrap();
        let decoded = reader.read_all(3).await.unwrap();
        assert_eq!(decoded, plaintext);

        let reads = source.reads.lock().unwrap();
        assert_eq!(reads[0], reader.layout().salt_range());
        assert!(
            reads
                .iter()
                .all(|r| r.end - r.start <= FRAME_SIZE as u64),
            "every read is a single frame or the salt"
        );
    }

    #[tokio::test]
    async fn test_reader_rejects_flipped_bit() {
        let mut encoded = encode(&sample(BUFFER_SIZE + 100));
        encoded[FRAME_SIZE + NONCE_SIZE + 3] ^= 0x80;
        let source = MemorySource::new(encoded);
        let passphrase = SecretString::from("hunter2");

        let reader = ContainerReader::open(
            &source,
            source.data.len() as u64,
            &passphrase,
            &test_kdf_params(),
        )
        .await
        .unwrap();

        assert!(reader.read_chunk(0).await.is_ok());
        assert!(matches!(
            reader.read_chunk(1).await,
            Err(CryptoError::AuthenticationFailure)
        ));
        assert!(reader.read_all(2).await.is_err());
    }

    #[tokio::test]
    async fn test_reader_wrong_passphrase_fails() {
        let source = MemorySource::new(encode(b"short secret"));
        let reader = ContainerReader::open(
            &source,
            source.data.len() as u64,
            &SecretString::from("not-hunter2"),
            &test_kdf_params(),
        )
        .await
        .unwrap();

        assert!(matches!(
            reader.read_chunk(0).await,
            Err(CryptoError::AuthenticationFailure)
        ));
    }
}
