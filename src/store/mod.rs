//! Ranged access to NDJSON shards in the blob store.

pub mod bgzf;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use rand::Rng;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::err::Error;

/// Entry in a listing of the blob store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
}

/// Whole-object sequential reader.
pub type ObjectReader = Pin<Box<dyn AsyncBufRead + Send>>;

/// Minimal blob-store surface the engine needs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// List all objects under `prefix` with their sizes, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, Error>;

    /// Read the bytes `[start, end)` of an object; `end == None` reads to
    /// the end of the object.
    async fn read_range(&self, key: &str, start: u64, end: Option<u64>)
        -> Result<Vec<u8>, Error>;

    /// Open the whole object as a sequential reader.
    async fn read_object(&self, key: &str) -> Result<ObjectReader, Error>;
}

/// Production blob store backed by the AWS S3 client.
pub struct S3Blobs {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Blobs {
    pub fn new(client: aws_sdk_s3::Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    /// Upload a local file to `key`.
    pub async fn put_file(&self, key: &str, path: &std::path::Path) -> Result<(), Error> {
        let body = aws_sdk_s3::primitives::ByteStream::from_path(path)
            .await
            .map_err(|e| Error::BlobRead(format!("could not open file {:?}: {}", path, e)))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                Error::BlobRead(format!("could not upload {}: {}", key, DisplayErrorContext(e)))
            })?;
        Ok(())
    }

    /// Upload an in-memory buffer to `key`.
    pub async fn put_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<(), Error> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(aws_sdk_s3::primitives::ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| {
                Error::BlobRead(format!("could not upload {}: {}", key, DisplayErrorContext(e)))
            })?;
        Ok(())
    }

    /// Delete the object at `key`.
    pub async fn delete(&self, key: &str) -> Result<(), Error> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                Error::BlobRead(format!("could not delete {}: {}", key, DisplayErrorContext(e)))
            })?;
        Ok(())
    }

    /// Download the object at `key` to a local file.
    pub async fn download(&self, key: &str, path: &std::path::Path) -> Result<(), Error> {
        let mut reader = self.read_object(key).await?;
        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| Error::BlobRead(format!("could not create {:?}: {}", path, e)))?;
        tokio::io::copy_buf(&mut reader, &mut file)
            .await
            .map_err(|e| Error::BlobRead(format!("could not download {}: {}", key, e)))?;
        Ok(())
    }
}

#[async_trait]
impl BlobStore for S3Blobs {
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, Error> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();
        let mut out = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| {
                Error::BlobRead(format!(
                    "could not list objects under {}: {}",
                    prefix,
                    DisplayErrorContext(e)
                ))
            })?;
            for object in page.contents() {
                if let (Some(key), Some(size)) = (object.key(), object.size()) {
                    out.push(ObjectInfo {
                        key: key.to_string(),
                        size: size as u64,
                    });
                }
            }
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn read_range(
        &self,
        key: &str,
        start: u64,
        end: Option<u64>,
    ) -> Result<Vec<u8>, Error> {
        if let Some(end) = end {
            if end <= start {
                return Ok(Vec::new());
            }
        }
        let range = match end {
            Some(end) => format!("bytes={}-{}", start, end - 1),
            None => format!("bytes={}-", start),
        };
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .range(range)
            .send()
            .await
            .map_err(|e| {
                Error::BlobRead(format!("could not read {}: {}", key, DisplayErrorContext(e)))
            })?;
        let data = response
            .body
            .collect()
            .await
            .map_err(|e| Error::BlobRead(format!("could not read body of {}: {}", key, e)))?;
        Ok(data.into_bytes().to_vec())
    }

    async fn read_object(&self, key: &str) -> Result<ObjectReader, Error> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                Error::BlobRead(format!("could not read {}: {}", key, DisplayErrorContext(e)))
            })?;
        Ok(Box::pin(response.body.into_async_read()))
    }
}

/// Number of attempts for transient blob errors.
const MAX_ATTEMPTS: u32 = 5;
/// Initial retry backoff.
const BACKOFF_BASE: Duration = Duration::from_millis(100);
/// Ranged reads larger than this are split into parallel GETs.
const PARALLEL_CHUNK: u64 = 1 << 20;

/// Record store: ranged NDJSON reads with retries and transparent BGZF
/// decompression. Callers never need to know whether an object is
/// compressed; offsets are always uncompressed positions.
pub struct RecordStore {
    blobs: Arc<dyn BlobStore>,
    gzi_cache: Mutex<HashMap<String, Arc<bgzf::GziIndex>>>,
}

impl RecordStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            blobs,
            gzi_cache: Mutex::new(HashMap::new()),
        }
    }

    /// List the shards of an index, honoring its compression state.
    pub async fn list_shards(
        &self,
        prefix: &str,
        compressed: bool,
    ) -> Result<Vec<ObjectInfo>, Error> {
        let all = self.blobs.list(prefix).await?;
        Ok(all
            .into_iter()
            .filter(|o| {
                if compressed {
                    o.key.ends_with(".gz")
                } else {
                    !o.key.ends_with(".gz") && !o.key.ends_with(".gzi")
                }
            })
            .collect())
    }

    /// Read a range, retrying transient failures with exponential backoff.
    async fn read_range_retry(
        &self,
        key: &str,
        start: u64,
        end: Option<u64>,
    ) -> Result<Vec<u8>, Error> {
        let mut delay = BACKOFF_BASE;
        let mut attempt = 1;
        loop {
            match self.blobs.read_range(key, start, end).await {
                Ok(bytes) => return Ok(bytes),
                Err(Error::BlobRead(reason)) if attempt < MAX_ATTEMPTS => {
                    let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64);
                    tracing::debug!(
                        "read of {} failed (attempt {}), retrying in {:?}: {}",
                        key,
                        attempt,
                        delay,
                        reason
                    );
                    tokio::time::sleep(delay + Duration::from_millis(jitter)).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fetch `[start, end)`, splitting large ranges into parallel GETs
    /// stitched back together in order.
    async fn fetch(&self, key: &str, start: u64, end: u64) -> Result<Vec<u8>, Error> {
        if end <= start {
            return Ok(Vec::new());
        }
        if end - start <= PARALLEL_CHUNK {
            return self.read_range_retry(key, start, Some(end)).await;
        }
        let mut reads = Vec::new();
        let mut pos = start;
        while pos < end {
            let chunk_end = (pos + PARALLEL_CHUNK).min(end);
            reads.push(self.read_range_retry(key, pos, Some(chunk_end)));
            pos = chunk_end;
        }
        let chunks = futures::future::try_join_all(reads).await?;
        Ok(chunks.concat())
    }

    /// The cached `.gzi` index of a compressed object.
    async fn gzi(&self, object: &str) -> Result<Arc<bgzf::GziIndex>, Error> {
        if let Some(index) = self
            .gzi_cache
            .lock()
            .expect("gzi cache lock poisoned")
            .get(object)
        {
            return Ok(index.clone());
        }
        let bytes = self
            .read_range_retry(&bgzf::gzi_key(object), 0, None)
            .await?;
        let index = Arc::new(bgzf::GziIndex::parse(&bytes).map_err(|e| {
            Error::CorruptShard {
                object: object.to_string(),
                reason: format!("unreadable .gzi: {}", e),
            }
        })?);
        self.gzi_cache
            .lock()
            .expect("gzi cache lock poisoned")
            .insert(object.to_string(), index.clone());
        Ok(index)
    }

    /// Read the uncompressed bytes `[start, end)` of an object.
    pub async fn read(
        &self,
        object: &str,
        start: u64,
        end: u64,
        compressed: bool,
    ) -> Result<Vec<u8>, Error> {
        if !compressed {
            return self.fetch(object, start, end).await;
        }
        if end <= start {
            return Ok(Vec::new());
        }
        let gzi = self.gzi(object).await?;
        let (c_start, c_end, u_start) = gzi.map_range(start, end);
        let compressed_bytes = match c_end {
            Some(c_end) => self.fetch(object, c_start, c_end).await?,
            None => self.read_range_retry(object, c_start, None).await?,
        };
        bgzf::inflate_range(&compressed_bytes, start - u_start, end - start).map_err(|e| {
            Error::CorruptShard {
                object: object.to_string(),
                reason: e.to_string(),
            }
        })
    }

    /// Open the whole object as a sequential line stream.
    pub async fn stream_object(
        &self,
        object: &str,
        compressed: bool,
    ) -> Result<LineStream, Error> {
        let reader = self.blobs.read_object(object).await?;
        let reader: ObjectReader = if compressed {
            let mut decoder = async_compression::tokio::bufread::GzipDecoder::new(reader);
            decoder.multiple_members(true);
            Box::pin(tokio::io::BufReader::new(decoder))
        } else {
            reader
        };
        Ok(LineStream {
            reader,
            offset: 0,
            buf: Vec::new(),
        })
    }
}

/// Sequential reader over the lines of one object, tracking the byte offset
/// at the start of each line (uncompressed offsets for BGZF objects).
pub struct LineStream {
    reader: ObjectReader,
    offset: u64,
    buf: Vec<u8>,
}

impl LineStream {
    /// The next line as `(start_offset, end_offset, bytes)` where
    /// `end_offset` points just past the line terminator and the returned
    /// bytes exclude it. `None` at end of object.
    pub async fn next_line(&mut self) -> Result<Option<(u64, u64, &[u8])>, Error> {
        self.buf.clear();
        let start = self.offset;
        let n = self
            .reader
            .read_until(b'\n', &mut self.buf)
            .await
            .map_err(|e| Error::BlobRead(format!("could not read line: {}", e)))?;
        if n == 0 {
            return Ok(None);
        }
        self.offset += n as u64;
        let mut line: &[u8] = &self.buf;
        if line.ends_with(b"\n") {
            line = &line[..line.len() - 1];
        }
        if line.ends_with(b"\r") {
            line = &line[..line.len() - 1];
        }
        Ok(Some((start, self.offset, line)))
    }
}

/// Split fetched bytes into the complete lines they contain.
///
/// Returns `(lines, next_offset)` where each line is `(start_offset, bytes)`
/// without its terminator and `next_offset` is where the next read should
/// resume. A trailing unterminated segment only counts as a line when
/// `at_end` marks the fetch as reaching the end of its range.
pub fn split_lines(base: u64, bytes: &[u8], at_end: bool) -> (Vec<(u64, &[u8])>, u64) {
    let mut lines = Vec::new();
    let mut pos = 0usize;
    let mut next = base;
    while pos < bytes.len() {
        match bytes[pos..].iter().position(|&b| b == b'\n') {
            Some(nl) => {
                let mut line = &bytes[pos..pos + nl];
                if line.ends_with(b"\r") {
                    line = &line[..line.len() - 1];
                }
                lines.push((base + pos as u64, line));
                pos += nl + 1;
                next = base + pos as u64;
            }
            None => {
                if at_end {
                    lines.push((base + pos as u64, &bytes[pos..]));
                    next = base + bytes.len() as u64;
                }
                break;
            }
        }
    }
    (lines, next)
}
