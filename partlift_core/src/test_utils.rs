//! Helpers for tests which need misbehaving clients

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt};

use crate::{
    errors::TransferError,
    integrity::PartHash,
    object_client::{
        FinishedPart, NewObjectParams, ObjectClient, ObjectInfo, PartSizeHints, PartUploadTarget,
        RemoteObjectId,
    },
    InclusiveRange,
};

#[derive(Default)]
struct Script {
    fail_upload_once: HashSet<u32>,
    fail_download_once: HashSet<u32>,
    corrupt_download: HashSet<u32>,
    fatal_upload_at: Option<u32>,
    reject_tokens: usize,
    stall_finish: bool,
}

/// Wraps an [ObjectClient] and injects failures according to a script
///
/// Part numbers of downloads are derived from the requested offset
/// which requires the part size of the planned transfer.
#[derive(Clone)]
pub struct FlakyObjectClient<C> {
    inner: C,
    part_size: u64,
    script: Arc<Mutex<Script>>,
    reauths: Arc<AtomicUsize>,
}

impl<C: ObjectClient> FlakyObjectClient<C> {
    pub fn new(inner: C, part_size: u64) -> Self {
        Self {
            inner,
            part_size,
            script: Arc::new(Mutex::new(Script::default())),
            reauths: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The upload of each given part fails transiently on its first attempt
    pub fn fail_upload_once<I: IntoIterator<Item = u32>>(self, parts: I) -> Self {
        self.script.lock().unwrap().fail_upload_once.extend(parts);
        self
    }

    /// The download of each given part fails transiently on its first attempt
    pub fn fail_download_once<I: IntoIterator<Item = u32>>(self, parts: I) -> Self {
        self.script.lock().unwrap().fail_download_once.extend(parts);
        self
    }

    /// The given parts download with their first byte flipped
    pub fn corrupt_download<I: IntoIterator<Item = u32>>(self, parts: I) -> Self {
        self.script.lock().unwrap().corrupt_download.extend(parts);
        self
    }

    /// Uploading the given part always fails fatally
    pub fn fatal_upload_at(self, part: u32) -> Self {
        self.script.lock().unwrap().fatal_upload_at = Some(part);
        self
    }

    /// The next `n` part transfers are rejected with an expired token
    pub fn reject_tokens(self, n: usize) -> Self {
        self.script.lock().unwrap().reject_tokens = n;
        self
    }

    /// Finishing a large object never returns
    pub fn stall_finish(self) -> Self {
        self.script.lock().unwrap().stall_finish = true;
        self
    }

    /// How often [refresh_auth](ObjectClient::refresh_auth) was called
    pub fn reauth_count(&self) -> usize {
        self.reauths.load(Ordering::SeqCst)
    }

    fn part_number_of(&self, range: InclusiveRange) -> u32 {
        (range.start() / self.part_size) as u32 + 1
    }

    /// Returns the scripted error for an upload attempt of `part` if any
    fn upload_disturbance(&self, part: u32) -> Option<TransferError> {
        let mut script = self.script.lock().unwrap();
        if script.fatal_upload_at == Some(part) {
            return Some(TransferError::new_fatal(format!(
                "scripted fatal failure at part {part}"
            )));
        }
        if script.reject_tokens > 0 {
            script.reject_tokens -= 1;
            return Some(TransferError::new_reauth_required("scripted expired token"));
        }
        if script.fail_upload_once.remove(&part) {
            return Some(TransferError::new_transient(format!(
                "scripted transient failure at part {part}"
            )));
        }
        None
    }

    fn download_disturbance(&self, part: u32) -> Option<TransferError> {
        let mut script = self.script.lock().unwrap();
        if script.reject_tokens > 0 {
            script.reject_tokens -= 1;
            return Some(TransferError::new_reauth_required("scripted expired token"));
        }
        if script.fail_download_once.remove(&part) {
            return Some(TransferError::new_transient(format!(
                "scripted transient failure at part {part}"
            )));
        }
        None
    }

    fn corrupts(&self, part: u32) -> bool {
        self.script.lock().unwrap().corrupt_download.contains(&part)
    }
}

impl<C: ObjectClient> ObjectClient for FlakyObjectClient<C> {
    fn get_object_info(
        &self,
        id: RemoteObjectId,
    ) -> BoxFuture<'static, Result<ObjectInfo, TransferError>> {
        self.inner.get_object_info(id)
    }

    fn download_range(
        &self,
        id: RemoteObjectId,
        range: InclusiveRange,
    ) -> BoxFuture<'static, Result<Bytes, TransferError>> {
        let part = self.part_number_of(range);
        if let Some(err) = self.download_disturbance(part) {
            return futures::future::ready(Err(err)).boxed();
        }

        let corrupt = self.corrupts(part);
        let inner = self.inner.download_range(id, range);
        async move {
            let bytes = inner.await?;
            if corrupt {
                let mut corrupted = bytes.to_vec();
                if let Some(first) = corrupted.first_mut() {
                    *first = !*first;
                }
                Ok(Bytes::from(corrupted))
            } else {
                Ok(bytes)
            }
        }
        .boxed()
    }

    fn upload_object(
        &self,
        params: NewObjectParams,
        bytes: Bytes,
    ) -> BoxFuture<'static, Result<RemoteObjectId, TransferError>> {
        self.inner.upload_object(params, bytes)
    }

    fn start_large_object(
        &self,
        params: NewObjectParams,
    ) -> BoxFuture<'static, Result<RemoteObjectId, TransferError>> {
        self.inner.start_large_object(params)
    }

    fn part_upload_target(
        &self,
        object_id: RemoteObjectId,
    ) -> BoxFuture<'static, Result<PartUploadTarget, TransferError>> {
        self.inner.part_upload_target(object_id)
    }

    fn upload_part(
        &self,
        target: PartUploadTarget,
        part_number: u32,
        part_hash: PartHash,
        bytes: Bytes,
    ) -> BoxFuture<'static, Result<(), TransferError>> {
        if let Some(err) = self.upload_disturbance(part_number) {
            return futures::future::ready(Err(err)).boxed();
        }
        self.inner.upload_part(target, part_number, part_hash, bytes)
    }

    fn finish_large_object(
        &self,
        id: RemoteObjectId,
        parts: Vec<FinishedPart>,
    ) -> BoxFuture<'static, Result<(), TransferError>> {
        let stall = self.script.lock().unwrap().stall_finish;
        let inner = self.inner.finish_large_object(id, parts);
        async move {
            if stall {
                tokio::time::sleep(std::time::Duration::from_secs(3_600)).await;
            }
            inner.await
        }
        .boxed()
    }

    fn part_size_hints(&self) -> BoxFuture<'static, Result<Option<PartSizeHints>, TransferError>> {
        let part_size = self.part_size;
        futures::future::ready(Ok(Some(PartSizeHints {
            min_part_size: 1,
            recommended_part_size: part_size,
        })))
        .boxed()
    }

    fn refresh_auth(&self) -> BoxFuture<'static, Result<(), TransferError>> {
        self.reauths.fetch_add(1, Ordering::SeqCst);
        self.inner.refresh_auth()
    }
}

/// Bytes where every position depends on its absolute offset
///
/// Corruption and misordering become visible in comparisons.
pub fn pattern_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
