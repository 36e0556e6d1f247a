//! The transfer machinery composing planner, pool and assembler
use std::{
    future::Future,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt};
use tokio::{io::AsyncWrite, sync::mpsc};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    config::Config,
    errors::TransferError,
    integrity::{self, ContentHash, PartHash},
    object_client::{
        FinishedPart, NewObjectParams, ObjectClient, PartSizeHints, PartUploadTarget,
        RemoteObjectId,
    },
    planner::{PartDescriptor, TransferPlan},
    probe::Probe,
    DownloadOutcome, UploadOutcome, UploadRequest, UploadSource,
};

mod assembler;
mod backoff;
mod governor;
mod pool;

#[cfg(test)]
mod tests;

use self::pool::PartTransfer;

/// This is just a wrapper for not having to do
/// all the "matches" all over the place...
#[derive(Clone)]
pub(crate) enum ProbeInternal<P: Probe + Clone> {
    /// No instrumentation at all
    Off,
    /// We have a [Probe] from the probe factory
    One(P),
    /// We got a [Probe] for this single transfer only
    OneDyn(Arc<dyn Probe>),
    /// We have a [Probe] from the probe factory and got one
    /// for this single transfer on top
    Two(P, Arc<dyn Probe>),
}

impl<P: Probe + Clone> Probe for ProbeInternal<P> {
    #[inline]
    fn transfer_started(&self) {
        match self {
            ProbeInternal::Off => {}
            ProbeInternal::One(p) => p.transfer_started(),
            ProbeInternal::OneDyn(p) => p.transfer_started(),
            ProbeInternal::Two(p1, p2) => {
                p1.transfer_started();
                p2.transfer_started();
            }
        }
    }

    #[inline]
    fn transfer_completed(&self, time: std::time::Duration) {
        match self {
            ProbeInternal::Off => {}
            ProbeInternal::One(p) => p.transfer_completed(time),
            ProbeInternal::OneDyn(p) => p.transfer_completed(time),
            ProbeInternal::Two(p1, p2) => {
                p1.transfer_completed(time);
                p2.transfer_completed(time);
            }
        }
    }

    #[inline]
    fn transfer_failed(&self, time: Option<std::time::Duration>) {
        match self {
            ProbeInternal::Off => {}
            ProbeInternal::One(p) => p.transfer_failed(time),
            ProbeInternal::OneDyn(p) => p.transfer_failed(time),
            ProbeInternal::Two(p1, p2) => {
                p1.transfer_failed(time);
                p2.transfer_failed(time);
            }
        }
    }

    #[inline]
    fn retry_attempt(
        &self,
        error: &TransferError,
        part_number: u32,
        next_in: std::time::Duration,
    ) {
        match self {
            ProbeInternal::Off => {}
            ProbeInternal::One(p) => p.retry_attempt(error, part_number, next_in),
            ProbeInternal::OneDyn(p) => p.retry_attempt(error, part_number, next_in),
            ProbeInternal::Two(p1, p2) => {
                p1.retry_attempt(error, part_number, next_in);
                p2.retry_attempt(error, part_number, next_in);
            }
        }
    }

    #[inline]
    fn reauth_attempt(&self, part_number: u32) {
        match self {
            ProbeInternal::Off => {}
            ProbeInternal::One(p) => p.reauth_attempt(part_number),
            ProbeInternal::OneDyn(p) => p.reauth_attempt(part_number),
            ProbeInternal::Two(p1, p2) => {
                p1.reauth_attempt(part_number);
                p2.reauth_attempt(part_number);
            }
        }
    }

    #[inline]
    fn part_started(&self, part_number: u32, range: crate::InclusiveRange) {
        match self {
            ProbeInternal::Off => {}
            ProbeInternal::One(p) => p.part_started(part_number, range),
            ProbeInternal::OneDyn(p) => p.part_started(part_number, range),
            ProbeInternal::Two(p1, p2) => {
                p1.part_started(part_number, range);
                p2.part_started(part_number, range);
            }
        }
    }

    #[inline]
    fn part_completed(&self, part_number: u32, n_bytes: u64, time: std::time::Duration) {
        match self {
            ProbeInternal::Off => {}
            ProbeInternal::One(p) => p.part_completed(part_number, n_bytes, time),
            ProbeInternal::OneDyn(p) => p.part_completed(part_number, n_bytes, time),
            ProbeInternal::Two(p1, p2) => {
                p1.part_completed(part_number, n_bytes, time);
                p2.part_completed(part_number, n_bytes, time);
            }
        }
    }

    #[inline]
    fn part_failed(&self, error: &TransferError, part_number: u32, range: &crate::InclusiveRange) {
        match self {
            ProbeInternal::Off => {}
            ProbeInternal::One(p) => p.part_failed(error, part_number, range),
            ProbeInternal::OneDyn(p) => p.part_failed(error, part_number, range),
            ProbeInternal::Two(p1, p2) => {
                p1.part_failed(error, part_number, range);
                p2.part_failed(error, part_number, range);
            }
        }
    }

    #[inline]
    fn concurrency_changed(&self, from: usize, to: usize) {
        match self {
            ProbeInternal::Off => {}
            ProbeInternal::One(p) => p.concurrency_changed(from, to),
            ProbeInternal::OneDyn(p) => p.concurrency_changed(from, to),
            ProbeInternal::Two(p1, p2) => {
                p1.concurrency_changed(from, to);
                p2.concurrency_changed(from, to);
            }
        }
    }

    #[inline]
    fn panic_detected(&self, msg: &str) {
        match self {
            ProbeInternal::Off => {}
            ProbeInternal::One(p) => p.panic_detected(msg),
            ProbeInternal::OneDyn(p) => p.panic_detected(msg),
            ProbeInternal::Two(p1, p2) => {
                p1.panic_detected(msg);
                p2.panic_detected(msg);
            }
        }
    }
}

pub(crate) async fn upload_object<C: ObjectClient, P: Probe + Clone>(
    client: C,
    config: Config,
    request: UploadRequest,
    probe: P,
) -> Result<UploadOutcome, TransferError> {
    let object_name = request.object_name.clone();
    let span = info_span!("upload", object_name = %object_name);

    async move {
        let started_at = Instant::now();
        probe.transfer_started();

        let result = upload_object_inner(client, &config, request, &probe).await;

        match &result {
            Ok(outcome) => {
                probe.transfer_completed(started_at.elapsed());
                if config.log_transfer_messages_as_debug.into_inner() {
                    debug!(parts = outcome.part_count, "upload completed");
                } else {
                    info!(parts = outcome.part_count, "upload completed");
                }
            }
            Err(err) => {
                probe.transfer_failed(Some(started_at.elapsed()));
                warn!("upload failed: {err}");
            }
        }

        result
    }
    .instrument(span)
    .await
}

async fn upload_object_inner<C: ObjectClient, P: Probe + Clone>(
    client: C,
    config: &Config,
    request: UploadRequest,
    probe: &P,
) -> Result<UploadOutcome, TransferError> {
    let deadline = TransferDeadline::after(config.transfer_timeout());

    let source = PartSource::new(request.source);
    let total_size = source.total_size().await?;

    let content_hash = match request.content_hash {
        Some(hash) => hash,
        None => deadline.bound(source.hash_contents()).await?,
    };

    let hints = deadline
        .bound(effective_part_size_hints(&client, config))
        .await?;
    let plan = TransferPlan::new(total_size, hints)?;
    debug!(
        total_size,
        parts = plan.part_count(),
        part_size = plan.part_size(),
        "planned upload"
    );

    let params = NewObjectParams {
        object_name: request.object_name,
        mime_type: request.mime_type,
        content_hash: content_hash.clone(),
        total_size,
    };

    if plan.is_single_part() {
        // Not worth the large object protocol
        let bytes = source.read_all().await?;
        let remote_id = deadline
            .bound(with_reauth(&client, || {
                client.upload_object(params.clone(), bytes.clone())
            }))
            .await?;
        return Ok(UploadOutcome {
            remote_id,
            content_hash,
            part_count: 1,
            bytes_transferred: total_size,
        });
    }

    let remote_id = deadline
        .bound(with_reauth(&client, || {
            client.start_large_object(params.clone())
        }))
        .await?;
    debug!(%remote_id, "started large object");

    let worker_count = plan.effective_concurrency(config.max_concurrency.into_inner());

    // Each worker gets its own upload target up front. A rejected
    // target is replaced by the worker itself later.
    let mut targets = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        let target = deadline
            .bound(with_reauth(&client, || {
                client.part_upload_target(remote_id.clone())
            }))
            .await?;
        targets.push(Mutex::new(target));
    }

    let transfer = UploadPartTransfer {
        client: client.clone(),
        object_id: remote_id.clone(),
        source,
        targets: Arc::new(targets),
    };

    let mut results = pool::run_pool(
        plan.parts().collect(),
        transfer,
        worker_count,
        config,
        probe.clone(),
        deadline.remaining()?,
    )
    .await?;

    // The store wants the hashes in part number order no matter in
    // which order the parts completed
    results.sort_unstable_by_key(|result| result.part_number);
    let finished_parts: Vec<FinishedPart> = results
        .into_iter()
        .map(|result| FinishedPart {
            part_number: result.part_number,
            part_hash: result.payload,
        })
        .collect();

    deadline
        .bound(with_reauth(&client, || {
            client.finish_large_object(remote_id.clone(), finished_parts.clone())
        }))
        .await?;

    Ok(UploadOutcome {
        remote_id,
        content_hash,
        part_count: plan.part_count(),
        bytes_transferred: total_size,
    })
}

pub(crate) async fn download_object<C, P, W>(
    client: C,
    config: Config,
    id: RemoteObjectId,
    sink: &mut W,
    probe: P,
) -> Result<DownloadOutcome, TransferError>
where
    C: ObjectClient,
    P: Probe + Clone,
    W: AsyncWrite + Unpin,
{
    let span = info_span!("download", object_id = %id);

    async move {
        let started_at = Instant::now();
        probe.transfer_started();

        let result = download_object_inner(client, &config, id, sink, &probe).await;

        match &result {
            Ok(outcome) => {
                probe.transfer_completed(started_at.elapsed());
                if config.log_transfer_messages_as_debug.into_inner() {
                    debug!(bytes = outcome.bytes_written, "download completed");
                } else {
                    info!(bytes = outcome.bytes_written, "download completed");
                }
            }
            Err(err) => {
                probe.transfer_failed(Some(started_at.elapsed()));
                warn!("download failed: {err}");
            }
        }

        result
    }
    .instrument(span)
    .await
}

async fn download_object_inner<C, P, W>(
    client: C,
    config: &Config,
    id: RemoteObjectId,
    sink: &mut W,
    probe: &P,
) -> Result<DownloadOutcome, TransferError>
where
    C: ObjectClient,
    P: Probe + Clone,
    W: AsyncWrite + Unpin,
{
    let deadline = TransferDeadline::after(config.transfer_timeout());

    let info = deadline
        .bound(with_reauth(&client, || client.get_object_info(id.clone())))
        .await?;

    let hints = deadline
        .bound(effective_part_size_hints(&client, config))
        .await?;
    let plan = TransferPlan::new(info.size_in_bytes, hints)?;
    debug!(
        total_size = info.size_in_bytes,
        parts = plan.part_count(),
        "planned download"
    );

    let worker_count = plan.effective_concurrency(config.max_concurrency.into_inner());
    let transfer = DownloadPartTransfer {
        client,
        object_id: id,
    };

    let (results_sender, mut results_receiver) = mpsc::unbounded_channel();

    let pool_deadline = deadline.remaining()?;

    // The assembler writes parts out while the pool is still
    // fetching so writing never blocks part transfers
    let (pool_result, assembled) = tokio::join!(
        pool::run_pool_dispatch(
            plan.parts().collect(),
            transfer,
            worker_count,
            config,
            probe.clone(),
            pool_deadline,
            results_sender,
        ),
        assembler::assemble(plan.part_count(), &mut results_receiver, sink),
    );

    // A pool error also tears down the assembler. The pool error
    // is the one worth reporting.
    pool_result?;
    let (content_hash, bytes_written) = assembled?;

    if let Some(expected) = &info.content_hash {
        if expected != &content_hash {
            return Err(TransferError::new_integrity(format!(
                "content hash mismatch: stored {expected} but reassembled {content_hash}"
            )));
        }
    }

    Ok(DownloadOutcome {
        content_hash,
        bytes_written,
        part_count: plan.part_count(),
    })
}

/// The absolute deadline of a whole transfer
///
/// Every phase runs under the remaining budget: control plane calls
/// are bounded individually and the worker pool receives whatever is
/// left when it starts. A transfer therefore never outlives its
/// configured timeout, no matter which phase stalls.
#[derive(Clone, Copy)]
struct TransferDeadline {
    deadline: Option<(Duration, tokio::time::Instant)>,
}

impl TransferDeadline {
    fn after(timeout: Option<Duration>) -> Self {
        Self {
            deadline: timeout.map(|timeout| (timeout, tokio::time::Instant::now() + timeout)),
        }
    }

    fn exceeded(timeout: Duration) -> TransferError {
        TransferError::new_other(format!("transfer deadline of {timeout:?} exceeded"))
    }

    /// The budget left, or an error once it is used up
    fn remaining(&self) -> Result<Option<Duration>, TransferError> {
        match self.deadline {
            None => Ok(None),
            Some((timeout, at)) => {
                let now = tokio::time::Instant::now();
                if now >= at {
                    Err(Self::exceeded(timeout))
                } else {
                    Ok(Some(at - now))
                }
            }
        }
    }

    /// Run a call under the remaining budget
    async fn bound<T, F>(&self, call: F) -> Result<T, TransferError>
    where
        F: Future<Output = Result<T, TransferError>>,
    {
        match (self.remaining()?, self.deadline) {
            (Some(rest), Some((timeout, _))) => tokio::time::timeout(rest, call)
                .await
                .map_err(|_| Self::exceeded(timeout))?,
            _ => call.await,
        }
    }
}

/// The negotiated part size bounds or the configured fallbacks
async fn effective_part_size_hints<C: ObjectClient>(
    client: &C,
    config: &Config,
) -> Result<PartSizeHints, TransferError> {
    let hints = with_reauth(client, || client.part_size_hints()).await?;
    Ok(hints.unwrap_or_else(|| PartSizeHints {
        min_part_size: config.fallback_min_part_size.into_inner(),
        recommended_part_size: config.fallback_recommended_part_size.into_inner(),
    }))
}

/// Runs a call and repeats it once after a re-authorization if the
/// first attempt was rejected with an expired token
async fn with_reauth<C, T, F, Fut>(client: &C, call: F) -> Result<T, TransferError>
where
    C: ObjectClient,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, TransferError>>,
{
    match call().await {
        Err(err) if err.is_reauth_required() => {
            debug!("token rejected, re-authorizing");
            client.refresh_auth().await?;
            call().await
        }
        other => other,
    }
}

/// Where the bytes of an upload come from
#[derive(Clone)]
enum PartSource {
    Bytes(Bytes),
    File(Arc<PathBuf>),
}

impl PartSource {
    fn new(source: UploadSource) -> Self {
        match source {
            UploadSource::Bytes(bytes) => PartSource::Bytes(bytes),
            UploadSource::File(path) => PartSource::File(Arc::new(path)),
        }
    }

    async fn total_size(&self) -> Result<u64, TransferError> {
        match self {
            PartSource::Bytes(bytes) => Ok(bytes.len() as u64),
            PartSource::File(path) => {
                let metadata = tokio::fs::metadata(path.as_ref()).await.map_err(|err| {
                    TransferError::new_io(format!("cannot stat '{}'", path.display()))
                        .with_source(err)
                })?;
                Ok(metadata.len())
            }
        }
    }

    async fn hash_contents(&self) -> Result<ContentHash, TransferError> {
        match self {
            PartSource::Bytes(bytes) => Ok(integrity::hash_bytes(bytes)),
            PartSource::File(path) => integrity::hash_file(path.as_ref()).await,
        }
    }

    async fn read_all(&self) -> Result<Bytes, TransferError> {
        match self {
            PartSource::Bytes(bytes) => Ok(bytes.clone()),
            PartSource::File(path) => {
                let contents = tokio::fs::read(path.as_ref()).await.map_err(|err| {
                    TransferError::new_io(format!("cannot read '{}'", path.display()))
                        .with_source(err)
                })?;
                Ok(Bytes::from(contents))
            }
        }
    }

    /// Read the bytes of one part
    ///
    /// Files are opened per attempt so that concurrent workers
    /// never share a file handle or its cursor.
    async fn read_part(&self, part: PartDescriptor) -> Result<Bytes, TransferError> {
        match self {
            PartSource::Bytes(bytes) => {
                let start = part.offset as usize;
                let end = start + part.len as usize;
                if end > bytes.len() {
                    return Err(TransferError::new_invalid_plan(format!(
                        "{part} exceeds source of {} bytes",
                        bytes.len()
                    )));
                }
                Ok(bytes.slice(start..end))
            }
            PartSource::File(path) => {
                use tokio::io::{AsyncReadExt, AsyncSeekExt};

                let io_err = |err: std::io::Error| {
                    TransferError::new_io(format!("cannot read {part} of '{}'", path.display()))
                        .with_source(err)
                };

                let mut file = tokio::fs::File::open(path.as_ref()).await.map_err(io_err)?;
                file.seek(std::io::SeekFrom::Start(part.offset))
                    .await
                    .map_err(io_err)?;
                let mut buffer = vec![0u8; part.len as usize];
                file.read_exact(&mut buffer).await.map_err(io_err)?;
                Ok(Bytes::from(buffer))
            }
        }
    }
}

/// Uploads one part to the worker's upload target
#[derive(Clone)]
struct UploadPartTransfer<C: ObjectClient> {
    client: C,
    object_id: RemoteObjectId,
    source: PartSource,
    /// One slot per worker, only replaced on re-authorization
    targets: Arc<Vec<Mutex<PartUploadTarget>>>,
}

impl<C: ObjectClient> UploadPartTransfer<C> {
    fn target(&self, slot: usize) -> PartUploadTarget {
        match self.targets[slot].lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_target(&self, slot: usize, target: PartUploadTarget) {
        let mut guard = match self.targets[slot].lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = target;
    }
}

impl<C: ObjectClient> PartTransfer for UploadPartTransfer<C> {
    type Payload = PartHash;

    fn transfer(
        &self,
        part: PartDescriptor,
        slot: usize,
    ) -> BoxFuture<'static, Result<PartHash, TransferError>> {
        let me = self.clone();
        async move {
            let bytes = me.source.read_part(part).await?;
            let part_hash = integrity::part_hash(&bytes);
            me.client
                .upload_part(me.target(slot), part.part_number, part_hash.clone(), bytes)
                .await?;
            Ok(part_hash)
        }
        .boxed()
    }

    fn reauthorize(&self, slot: usize) -> BoxFuture<'static, Result<(), TransferError>> {
        let me = self.clone();
        async move {
            me.client.refresh_auth().await?;
            let target = me.client.part_upload_target(me.object_id.clone()).await?;
            me.set_target(slot, target);
            Ok(())
        }
        .boxed()
    }
}

/// Fetches one byte range of the object
#[derive(Clone)]
struct DownloadPartTransfer<C: ObjectClient> {
    client: C,
    object_id: RemoteObjectId,
}

impl<C: ObjectClient> PartTransfer for DownloadPartTransfer<C> {
    type Payload = Bytes;

    fn transfer(
        &self,
        part: PartDescriptor,
        _slot: usize,
    ) -> BoxFuture<'static, Result<Bytes, TransferError>> {
        let me = self.clone();
        async move {
            let bytes = me
                .client
                .download_range(me.object_id.clone(), part.range())
                .await?;
            if bytes.len() as u64 != part.len {
                // A short body is worth another attempt
                return Err(TransferError::new_transient(format!(
                    "{part} returned {} bytes",
                    bytes.len()
                )));
            }
            Ok(bytes)
        }
        .boxed()
    }

    fn reauthorize(&self, _slot: usize) -> BoxFuture<'static, Result<(), TransferError>> {
        self.client.refresh_auth()
    }
}
