//! In-memory origin and destination doubles for engine tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};

use super::paths::{self, normalize};
use crate::destination::{DestinationError, ObjectStore, ObjectWriter};
use crate::origin::{ByteStream, Entry, ListOptions, ListPage, OriginError, OriginStore};

#[derive(Debug, Clone, Copy)]
pub enum ReadFailure {
    /// 503 on open.
    Transient,
    /// 404 on open.
    Missing,
    /// First chunk arrives, then the body errors.
    MidStream,
    /// Opening succeeds only after this many failed attempts.
    TransientTimes(u32),
}

/// Origin serving a fixed tree. `list` behaves like the real flat listing:
/// entries sorted by path, starting at the cursor, bounded by `end`.
#[derive(Default)]
pub struct FakeOrigin {
    files: BTreeMap<String, Bytes>,
    failures: Mutex<HashMap<String, ReadFailure>>,
    reads: Mutex<HashMap<String, u32>>,
    list_calls: AtomicUsize,
    dir_calls: Mutex<Vec<String>>,
    dir_failures: Mutex<HashMap<String, ReadFailure>>,
    /// List calls from this index on fail with 503.
    fail_list_from: Mutex<Option<usize>>,
}

impl FakeOrigin {
    pub fn new<I, S>(files: I) -> Self
    where
        I: IntoIterator<Item = (S, &'static str)>,
        S: AsRef<str>,
    {
        Self {
            files: files
                .into_iter()
                .map(|(path, body)| (normalize(path.as_ref()), Bytes::from_static(body.as_bytes())))
                .collect(),
            ..Self::default()
        }
    }

    pub fn fail_reads(&self, path: &str, failure: ReadFailure) {
        self.failures
            .lock()
            .unwrap()
            .insert(normalize(path), failure);
    }

    /// Makes `dir` calls for `path` fail. `MidStream` does not apply to
    /// directory reads and is ignored.
    pub fn fail_dir(&self, path: &str, failure: ReadFailure) {
        self.dir_failures
            .lock()
            .unwrap()
            .insert(normalize(path), failure);
    }

    pub fn fail_list_from(&self, call: usize) {
        *self.fail_list_from.lock().unwrap() = Some(call);
    }

    pub fn reads_of(&self, path: &str) -> u32 {
        self.reads
            .lock()
            .unwrap()
            .get(&normalize(path))
            .copied()
            .unwrap_or(0)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn dir_calls(&self) -> Vec<String> {
        self.dir_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl OriginStore for FakeOrigin {
    async fn list(&self, path: &str, options: &ListOptions) -> Result<ListPage, OriginError> {
        let call = self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(from) = *self.fail_list_from.lock().unwrap() {
            if call >= from {
                return Err(OriginError::HttpStatus {
                    status: 503,
                    path: path.to_string(),
                });
            }
        }

        let start = normalize(path);
        let mut remaining = self
            .files
            .keys()
            .filter(|p| **p >= start)
            .filter(|p| options.end.as_ref().map_or(true, |end| *p < end));

        let entries: Vec<Entry> = remaining
            .by_ref()
            .take(options.max_entries)
            .map(|p| Entry::file(p.trim_start_matches('/')))
            .collect();
        let resume = remaining.next().map(|p| p.trim_start_matches('/').to_string());

        Ok(ListPage { resume, entries })
    }

    async fn dir(&self, path: &str) -> Result<Vec<Entry>, OriginError> {
        let dir = normalize(path);
        let attempt = {
            let mut calls = self.dir_calls.lock().unwrap();
            calls.push(dir.clone());
            calls.iter().filter(|d| **d == dir).count() as u32
        };

        let status = match self.dir_failures.lock().unwrap().get(&dir).copied() {
            Some(ReadFailure::Transient) => Some(503),
            Some(ReadFailure::TransientTimes(n)) if attempt <= n => Some(503),
            Some(ReadFailure::Missing) => Some(404),
            _ => None,
        };
        if let Some(status) = status {
            return Err(OriginError::HttpStatus { status, path: dir });
        }

        Ok(self
            .files
            .keys()
            .filter(|p| paths::parent(p) == dir)
            .map(|p| Entry::file(paths::file_name(p)))
            .collect())
    }

    async fn open_read(&self, path: &str) -> Result<ByteStream, OriginError> {
        let path = normalize(path);
        let attempt = {
            let mut reads = self.reads.lock().unwrap();
            let count = reads.entry(path.clone()).or_insert(0);
            *count += 1;
            *count
        };

        let failure = self.failures.lock().unwrap().get(&path).copied();
        let body = self
            .files
            .get(&path)
            .cloned()
            .ok_or_else(|| OriginError::HttpStatus {
                status: 404,
                path: path.clone(),
            })?;

        match failure {
            Some(ReadFailure::Transient) => Err(OriginError::HttpStatus {
                status: 503,
                path,
            }),
            Some(ReadFailure::TransientTimes(n)) if attempt <= n => {
                Err(OriginError::HttpStatus { status: 503, path })
            }
            Some(ReadFailure::Missing) => Err(OriginError::HttpStatus { status: 404, path }),
            Some(ReadFailure::MidStream) => {
                let first: Result<Bytes, OriginError> = Ok(body.slice(..body.len().min(2)));
                let broken: Result<Bytes, OriginError> = Err(OriginError::Malformed {
                    action: "download",
                    path,
                    reason: "connection reset".to_string(),
                });
                Ok(stream::iter(vec![first, broken]).boxed())
            }
            _ => {
                let chunks: Vec<Result<Bytes, OriginError>> = body
                    .chunks(3)
                    .map(|c| Ok(Bytes::copy_from_slice(c)))
                    .collect();
                Ok(stream::iter(chunks).boxed())
            }
        }
    }
}

#[derive(Default)]
struct StoreState {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    chunk_sizes: Mutex<HashMap<String, Vec<usize>>>,
    aborted: Mutex<HashSet<String>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

/// Destination that publishes objects only on `finish` and tracks how many
/// writers are open at once.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<StoreState>,
    finish_delay: Option<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_finish_delay(mut self, delay: Duration) -> Self {
        self.finish_delay = Some(delay);
        self
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.state.objects.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn chunk_sizes(&self, key: &str) -> Vec<usize> {
        self.state
            .chunk_sizes
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn was_aborted(&self, key: &str) -> bool {
        self.state.aborted.lock().unwrap().contains(key)
    }

    pub fn peak_concurrency(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn bucket(&self) -> &str {
        "media-archive"
    }

    async fn create_writer(&self, key: &str) -> Result<Box<dyn ObjectWriter>, DestinationError> {
        let now = self.state.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak.fetch_max(now, Ordering::SeqCst);
        Ok(Box::new(MemoryWriter {
            state: self.state.clone(),
            key: key.to_string(),
            buffer: Vec::new(),
            chunks: Vec::new(),
            finish_delay: self.finish_delay,
        }))
    }
}

struct MemoryWriter {
    state: Arc<StoreState>,
    key: String,
    buffer: Vec<u8>,
    chunks: Vec<usize>,
    finish_delay: Option<Duration>,
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        self.state.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectWriter for MemoryWriter {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), DestinationError> {
        self.chunks.push(chunk.len());
        self.buffer.extend_from_slice(&chunk);
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<u64, DestinationError> {
        if let Some(delay) = self.finish_delay {
            tokio::time::sleep(delay).await;
        }
        let size = self.buffer.len() as u64;
        let body = std::mem::take(&mut self.buffer);
        let chunks = std::mem::take(&mut self.chunks);
        self.state
            .objects
            .lock()
            .unwrap()
            .insert(self.key.clone(), body);
        self.state
            .chunk_sizes
            .lock()
            .unwrap()
            .insert(self.key.clone(), chunks);
        Ok(size)
    }

    async fn abort(self: Box<Self>) -> Result<(), DestinationError> {
        self.state.aborted.lock().unwrap().insert(self.key.clone());
        Ok(())
    }
}
