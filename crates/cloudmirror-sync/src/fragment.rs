//! Fragmentation of oversized objects
//!
//! Providers with a single-object size ceiling store a file as ordered
//! fragments named `{name}.frag{NNN}-of-{MMM}`. [`FragmentManager`] hides
//! that from the engines: uploads split transparently and
//! [`FragmentManager::reconstruct`] hands back one continuous stream.
//!
//! ## Design Notes
//!
//! - Content is streamed, never buffered whole. Each fragment upload reads
//!   its window straight off the shared source stream.
//! - A whole-content SHA-256 is computed on the way through so the caller
//!   can record a verifiable hash for the new replica.
//! - A transient upload failure is replayed from a fresh read of the
//!   source. Split uploads resume at the failed fragment and keep the ones
//!   already stored.
//! - Reconstruction checks that every fragment can be opened before
//!   returning, so an unreachable fragment is reported as a corrupt set up
//!   front instead of as a truncated stream. The returned stream then
//!   opens one fragment at a time.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{ready, Context, Poll};

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tracing::{debug, warn};

use cloudmirror_core::domain::{AccountKey, ContentHash, Replica, ReplicaFragment, ReplicaId};
use cloudmirror_core::ports::{ByteStream, CloudError, ICloudClient, IMetadataStore};
use cloudmirror_core::retry::RetryPolicy;

use crate::hashing::HashingReader;
use crate::SyncError;

const FRAGMENT_MARKER: &str = ".frag";
const FRAGMENT_SEPARATOR: &str = "-of-";

/// Object name of fragment `number` (1-based) out of `total`
pub fn fragment_name(name: &str, number: u32, total: u32) -> String {
    format!("{name}{FRAGMENT_MARKER}{number:03}{FRAGMENT_SEPARATOR}{total:03}")
}

/// Split a fragment object name into `(base name, number, total)`
pub fn parse_fragment_name(object_name: &str) -> Option<(&str, u32, u32)> {
    let idx = object_name.rfind(FRAGMENT_MARKER)?;
    let (base, suffix) = object_name.split_at(idx);
    let (number, total) = suffix[FRAGMENT_MARKER.len()..].split_once(FRAGMENT_SEPARATOR)?;
    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if base.is_empty() || !all_digits(number) || !all_digits(total) {
        return None;
    }
    let number: u32 = number.parse().ok()?;
    let total: u32 = total.parse().ok()?;
    (number >= 1 && number <= total).then_some((base, number, total))
}

/// One window of a split object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentSpan {
    pub number: u32,
    pub total: u32,
    pub offset: u64,
    pub len: u64,
}

/// Cut `size` bytes into windows of at most `max_chunk` bytes
///
/// Empty content still yields one (empty) fragment.
pub fn split(size: u64, max_chunk: u64) -> Vec<FragmentSpan> {
    let max_chunk = max_chunk.max(1);
    let total = size.div_ceil(max_chunk).max(1);
    let total_u32 = u32::try_from(total).unwrap_or(u32::MAX);
    (0..total)
        .map(|i| {
            let offset = i * max_chunk;
            FragmentSpan {
                number: (i + 1) as u32,
                total: total_u32,
                offset,
                len: max_chunk.min(size - offset.min(size)),
            }
        })
        .collect()
}

/// A stored fragment as returned by an upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFragment {
    pub number: u32,
    pub total: u32,
    pub size: u64,
    pub native_id: String,
}

/// Result of [`FragmentManager::upload`]
#[derive(Debug, Clone)]
pub struct UploadedObject {
    /// The object's id, or the first fragment's when fragmented
    pub native_id: String,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
    /// SHA-256 of the whole content
    pub hash: ContentHash,
    pub fragments: Vec<UploadedFragment>,
}

impl UploadedObject {
    pub fn is_fragmented(&self) -> bool {
        !self.fragments.is_empty()
    }

    /// Fragment rows for the replica that now holds this object
    pub fn fragment_rows(&self, replica_id: &ReplicaId) -> Vec<ReplicaFragment> {
        self.fragments
            .iter()
            .map(|f| ReplicaFragment::new(replica_id.clone(), f.number, f.total, f.size, &f.native_id))
            .collect()
    }
}

/// Reads at most `remaining` bytes from a source shared between fragments
struct WindowReader<R> {
    source: Arc<Mutex<R>>,
    remaining: u64,
    scratch: Vec<u8>,
}

impl<R> WindowReader<R> {
    fn new(source: Arc<Mutex<R>>, remaining: u64) -> Self {
        Self {
            source,
            remaining,
            scratch: Vec::new(),
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for WindowReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.remaining == 0 || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let limit = usize::try_from(self.remaining)
            .unwrap_or(usize::MAX)
            .min(buf.remaining());

        let this = &mut *self;
        this.scratch.resize(limit, 0);
        let mut window = ReadBuf::new(&mut this.scratch);
        let poll = {
            let mut source = this.source.lock().unwrap_or_else(PoisonError::into_inner);
            Pin::new(&mut *source).poll_read(cx, &mut window)
        };
        if let Poll::Ready(Ok(())) = poll {
            let filled = window.filled();
            buf.put_slice(filled);
            this.remaining -= filled.len() as u64;
        }
        poll
    }
}

/// Splits uploads and reassembles downloads
#[derive(Clone)]
pub struct FragmentManager {
    store: Arc<dyn IMetadataStore>,
    retry: RetryPolicy,
}

impl FragmentManager {
    pub fn new(store: Arc<dyn IMetadataStore>) -> Self {
        Self {
            store,
            retry: RetryPolicy::none(),
        }
    }

    /// Replay transiently failed uploads under `retry`
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Upload `size` bytes of `content` as `name` into `folder_id`,
    /// fragmenting when `max_object_size` is smaller than the content
    ///
    /// `reopen` yields the same content from the start; it is called only
    /// when an upload has to be replayed.
    #[allow(clippy::too_many_arguments)]
    pub async fn upload<F, Fut>(
        &self,
        client: &dyn ICloudClient,
        folder_id: &str,
        name: &str,
        content: ByteStream,
        size: u64,
        max_object_size: Option<u64>,
        reopen: F,
    ) -> Result<UploadedObject, SyncError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<ByteStream, SyncError>>,
    {
        let needs_split = max_object_size.is_some_and(|max| size > max);
        let Some(max_chunk) = max_object_size.filter(|_| needs_split) else {
            return self
                .upload_whole(client, folder_id, name, content, size, &reopen)
                .await;
        };

        let mut stored = Vec::new();
        let result = self
            .upload_split(client, folder_id, name, content, size, max_chunk, &reopen, &mut stored)
            .await;
        if result.is_err() {
            self.discard(client, &stored).await;
        }
        result
    }

    async fn upload_whole<F, Fut>(
        &self,
        client: &dyn ICloudClient,
        folder_id: &str,
        name: &str,
        content: ByteStream,
        size: u64,
        reopen: &F,
    ) -> Result<UploadedObject, SyncError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<ByteStream, SyncError>>,
    {
        let mut content = content;
        let mut attempt = 0;
        loop {
            let (reader, digest) = HashingReader::new(content);
            match client.upload_file(folder_id, name, Box::new(reader), size).await {
                Ok(remote) => {
                    return Ok(UploadedObject {
                        native_id: remote.native_id,
                        size: remote.size,
                        mod_time: remote.mod_time,
                        hash: digest.hash()?,
                        fragments: Vec::new(),
                    });
                }
                Err(err) => {
                    self.back_off(client.account(), name, attempt, err).await?;
                    attempt += 1;
                    content = reopen().await?;
                }
            }
        }
    }

    /// Upload every window of the content as its own object, pushing each
    /// stored fragment onto `stored` as soon as it lands
    #[allow(clippy::too_many_arguments)]
    async fn upload_split<F, Fut>(
        &self,
        client: &dyn ICloudClient,
        folder_id: &str,
        name: &str,
        content: ByteStream,
        size: u64,
        max_chunk: u64,
        reopen: &F,
        stored: &mut Vec<UploadedFragment>,
    ) -> Result<UploadedObject, SyncError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<ByteStream, SyncError>>,
    {
        let account = client.account();
        let (reader, mut digest) = HashingReader::new(content);
        let mut source = Arc::new(Mutex::new(reader));
        let mut mod_time = DateTime::<Utc>::MIN_UTC;

        for span in split(size, max_chunk) {
            let object_name = fragment_name(name, span.number, span.total);
            let checkpoint = digest.checkpoint();
            let mut attempt = 0;
            let remote = loop {
                let window = WindowReader::new(Arc::clone(&source), span.len);
                match client
                    .upload_file(folder_id, &object_name, Box::new(window), span.len)
                    .await
                {
                    Ok(remote) => break remote,
                    Err(err) => {
                        self.back_off(account, &object_name, attempt, err).await?;
                        attempt += 1;
                        let resumed = skip_bytes(reopen().await?, span.offset)
                            .await
                            .map_err(|e| SyncError::cloud(account, e))?;
                        let (reader, handle) = HashingReader::resume(resumed, checkpoint.checkpoint());
                        source = Arc::new(Mutex::new(reader));
                        digest = handle;
                    }
                }
            };
            debug!(account = %account, fragment = %object_name, size = span.len, "Uploaded fragment");
            mod_time = mod_time.max(remote.mod_time);
            stored.push(UploadedFragment {
                number: span.number,
                total: span.total,
                size: remote.size,
                native_id: remote.native_id,
            });
        }

        if digest.bytes() != size {
            return Err(SyncError::cloud(
                account,
                CloudError::Io(format!(
                    "source of {name} yielded {} bytes, expected {size}",
                    digest.bytes()
                )),
            ));
        }

        Ok(UploadedObject {
            native_id: stored
                .first()
                .map(|f| f.native_id.clone())
                .unwrap_or_default(),
            size,
            mod_time,
            hash: digest.hash()?,
            fragments: stored.clone(),
        })
    }

    /// Wait before replaying a failed upload, or give the error back when
    /// it should not be retried
    async fn back_off(
        &self,
        account: &AccountKey,
        object: &str,
        attempt: u32,
        err: CloudError,
    ) -> Result<(), SyncError> {
        let Some(delay) = self.retry.next_delay(attempt, &err) else {
            return Err(SyncError::cloud(account, err));
        };
        warn!(
            account = %account,
            object,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Upload failed, replaying from source"
        );
        tokio::time::sleep(delay).await;
        Ok(())
    }

    /// Best-effort removal of fragments left behind by a failed upload
    async fn discard(&self, client: &dyn ICloudClient, fragments: &[UploadedFragment]) {
        for fragment in fragments {
            if let Err(err) = client.delete_file(&fragment.native_id).await {
                warn!(
                    account = %client.account(),
                    native_id = %fragment.native_id,
                    error = %err,
                    "Could not remove orphaned fragment"
                );
            }
        }
    }

    /// Content of `replica`, reassembled from its fragments when needed
    pub async fn reconstruct(
        &self,
        client: &Arc<dyn ICloudClient>,
        replica: &Replica,
    ) -> Result<ByteStream, SyncError> {
        if !replica.fragmented {
            return client
                .download_file(&replica.native_id)
                .await
                .map_err(|e| SyncError::cloud(client.account(), e));
        }

        let fragments = self.store.get_fragments(&replica.id).await?;
        let corrupt = |reason: String| SyncError::CorruptFragmentSet {
            replica: replica.id.clone(),
            reason,
        };
        validate_fragment_set(&fragments).map_err(corrupt)?;

        let ids: Vec<&str> = fragments
            .iter()
            .map(|f| f.native_fragment_id.as_str())
            .collect();
        open_chain(client, &ids).await.map_err(|(id, err)| {
            corrupt(format!("fragment {id} unreachable: {err}"))
        })
    }
}

/// Check that fragments are numbered `1..=total` with nothing missing
pub fn validate_fragment_set(fragments: &[ReplicaFragment]) -> Result<(), String> {
    let Some(first) = fragments.first() else {
        return Err("no fragments recorded".into());
    };
    let total = first.fragments_total as usize;
    if fragments.len() != total {
        return Err(format!("{} of {total} fragments present", fragments.len()));
    }
    for (idx, fragment) in fragments.iter().enumerate() {
        if fragment.fragments_total as usize != total {
            return Err(format!(
                "fragment {} claims {} total, expected {total}",
                fragment.fragment_number, fragment.fragments_total
            ));
        }
        if fragment.fragment_number as usize != idx + 1 {
            return Err(format!(
                "fragment {} found where {} was expected",
                fragment.fragment_number,
                idx + 1
            ));
        }
    }
    Ok(())
}

/// Drop the first `offset` bytes of `stream`
async fn skip_bytes(mut stream: ByteStream, offset: u64) -> Result<ByteStream, CloudError> {
    let skipped = tokio::io::copy(&mut (&mut stream).take(offset), &mut tokio::io::sink()).await?;
    if skipped != offset {
        return Err(CloudError::Io(format!(
            "source ended after {skipped} bytes, {offset} needed to resume"
        )));
    }
    Ok(stream)
}

/// Check that every object can be opened, then chain them into one stream
/// that opens each object only once the previous one is exhausted
pub(crate) async fn open_chain(
    client: &Arc<dyn ICloudClient>,
    native_ids: &[&str],
) -> Result<ByteStream, (String, CloudError)> {
    for id in native_ids {
        let opened = client
            .download_file(id)
            .await
            .map_err(|e| (id.to_string(), e))?;
        drop(opened);
    }
    Ok(Box::new(ObjectChain {
        client: Arc::clone(client),
        pending: native_ids.iter().map(|id| id.to_string()).collect(),
        state: ChainState::Idle,
    }))
}

type OpenFuture = Pin<Box<dyn Future<Output = Result<ByteStream, CloudError>> + Send>>;

enum ChainState {
    Idle,
    Opening(OpenFuture),
    Reading(ByteStream),
}

/// Remote objects read back to back, at most one open at a time
struct ObjectChain {
    client: Arc<dyn ICloudClient>,
    pending: VecDeque<String>,
    state: ChainState,
}

impl AsyncRead for ObjectChain {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let this = &mut *self;
        loop {
            match &mut this.state {
                ChainState::Idle => {
                    let Some(id) = this.pending.pop_front() else {
                        return Poll::Ready(Ok(()));
                    };
                    let client = Arc::clone(&this.client);
                    this.state =
                        ChainState::Opening(Box::pin(async move { client.download_file(&id).await }));
                }
                ChainState::Opening(open) => match ready!(open.as_mut().poll(cx)) {
                    Ok(stream) => this.state = ChainState::Reading(stream),
                    Err(err) => {
                        this.state = ChainState::Idle;
                        this.pending.clear();
                        return Poll::Ready(Err(io::Error::other(err.to_string())));
                    }
                },
                ChainState::Reading(stream) => {
                    let before = buf.filled().len();
                    ready!(Pin::new(stream).poll_read(cx, buf))?;
                    if buf.filled().len() > before {
                        return Poll::Ready(Ok(()));
                    }
                    this.state = ChainState::Idle;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_name_round_trip() {
        let name = fragment_name("video.mp4", 2, 12);
        assert_eq!(name, "video.mp4.frag002-of-012");
        assert_eq!(parse_fragment_name(&name), Some(("video.mp4", 2, 12)));
    }

    #[test]
    fn test_parse_rejects_non_fragments() {
        assert_eq!(parse_fragment_name("notes.txt"), None);
        assert_eq!(parse_fragment_name(".frag001-of-002"), None);
        assert_eq!(parse_fragment_name("a.frag003-of-002"), None);
        assert_eq!(parse_fragment_name("a.frag000-of-002"), None);
        assert_eq!(parse_fragment_name("a.fragx-of-002"), None);
    }

    #[test]
    fn test_split_boundaries() {
        let spans = split(10, 4);
        let lens: Vec<u64> = spans.iter().map(|s| s.len).collect();
        assert_eq!(lens, vec![4, 4, 2]);
        assert!(spans.iter().all(|s| s.total == 3));
        assert_eq!(spans[2].offset, 8);

        assert_eq!(split(8, 4).len(), 2);
        let empty = split(0, 4);
        assert_eq!(empty.len(), 1);
        assert_eq!(empty[0].len, 0);
    }

    #[test]
    fn test_validate_fragment_set() {
        let replica = ReplicaId::new();
        let frag = |n, t| ReplicaFragment::new(replica.clone(), n, t, 1, format!("id{n}"));

        assert!(validate_fragment_set(&[frag(1, 2), frag(2, 2)]).is_ok());
        assert!(validate_fragment_set(&[]).is_err());
        assert!(validate_fragment_set(&[frag(1, 3), frag(2, 3)]).is_err());
        assert!(validate_fragment_set(&[frag(1, 2), frag(3, 2)]).is_err());
        assert!(validate_fragment_set(&[frag(2, 2), frag(1, 2)]).is_err());
    }

    #[tokio::test]
    async fn test_window_reader_stops_at_boundary() {
        let source = Arc::new(Mutex::new(std::io::Cursor::new(b"abcdefgh".to_vec())));
        let mut first = WindowReader::new(Arc::clone(&source), 3);
        let mut out = Vec::new();
        first.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abc");

        let mut rest = WindowReader::new(source, 10);
        out.clear();
        rest.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"defgh");
    }

    #[tokio::test]
    async fn test_object_chain_reads_in_order_and_reports_late_loss() {
        use chrono::Utc;
        use cloudmirror_core::domain::{AccountId, ProviderId};
        use cloudmirror_providers::MemoryCloud;

        let cloud = Arc::new(MemoryCloud::new(ProviderId::new("telegram").unwrap(), "sync"));
        let account = AccountId::new("me@x.com").unwrap();
        let client: Arc<dyn ICloudClient> = cloud.add_account(account.clone(), 1_000);
        let ids: Vec<String> = ["ab", "", "cde"]
            .iter()
            .enumerate()
            .map(|(i, part)| cloud.seed_file(&account, &format!("f{i}"), part.as_bytes(), Utc::now()))
            .collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();

        let mut out = Vec::new();
        open_chain(&client, &refs)
            .await
            .unwrap()
            .read_to_end(&mut out)
            .await
            .unwrap();
        assert_eq!(out, b"abcde");

        // opened lazily: a fragment lost after the check fails the read
        let mut chain = open_chain(&client, &refs).await.unwrap();
        client.delete_file(&ids[2]).await.unwrap();
        assert!(chain.read_to_end(&mut Vec::new()).await.is_err());

        let missing = open_chain(&client, &refs).await.err().unwrap();
        assert_eq!(missing.0, ids[2]);
    }
}
