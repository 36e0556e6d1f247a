//! # Partlift
//!
//! ## Overview
//!
//! Partlift moves BLOBs to and from a remote object store by
//! splitting each transfer into parts which are transferred
//! concurrently by a pool of workers.
//!
//! Uploads use the store's large object protocol: every part is
//! uploaded with its own hash, then the ordered list of part hashes
//! finishes the object. Downloads fetch byte ranges concurrently
//! and reassemble them strictly in order, verifying the whole
//! content hash recorded at upload time.
//!
//! This crate provides the core functionality only. To actually
//! use it, use an implementation crate such as `partlift_b2` or
//! implement the [ObjectClient](object_client::ObjectClient) trait
//! yourself.
//!
//! ## Usage
//!
//! In the examples below the [InMemoryObjectClient] is used.
//! Usually this would be some client which really accesses a
//! remote store.
//!
//! ```
//! use partlift_core::object_client::InMemoryObjectClient;
//! use partlift_core::{Partlift, UploadRequest, config::Config};
//!
//! # #[tokio::main]
//! # async fn main() {
//! // First we need a client...
//! let client = InMemoryObjectClient::new();
//!
//! // ... and a configuration
//! let config = Config::default();
//!
//! let partlift = Partlift::new(client, config).unwrap();
//!
//! let uploaded = partlift
//!     .upload(UploadRequest::from_bytes("greeting.txt", &b"hello remote world"[..]))
//!     .await
//!     .unwrap();
//! assert_eq!(uploaded.part_count, 1);
//!
//! let mut sink = Vec::new();
//! let downloaded = partlift.download(uploaded.remote_id, &mut sink).await.unwrap();
//!
//! assert_eq!(sink, b"hello remote world");
//! assert_eq!(downloaded.content_hash, uploaded.content_hash);
//! # }
//! ```
//!
//! ## Retries
//!
//! Transient failures of a single part are retried by the worker
//! pool with an exponential backoff and never surface to the
//! caller. An expired token triggers exactly one re-authorization
//! followed by one repetition of the failed call. Fatal failures
//! abort the whole transfer cooperatively.
//!
//! ## Instrumentation
//!
//! Instrumentation can be done for each individual transfer or
//! centralized for global monitoring. For further information see
//! the [probe] module.
//!
//! [InMemoryObjectClient]:object_client::InMemoryObjectClient
use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Error as AnyError;
use bytes::Bytes;
use tokio::io::AsyncWrite;

use config::Config;
use errors::TransferError;
use integrity::ContentHash;
use machinery::ProbeInternal;
use object_client::{ObjectClient, ObjectInfo, RemoteObjectId};
use probe::{Probe, ProbeFactory};

#[macro_use]
pub(crate) mod helpers;
mod batch;
pub mod config;
pub mod errors;
pub mod integrity;
mod machinery;
pub mod object_client;
pub mod planner;
pub mod probe;
mod range;
pub mod session;

pub use batch::{BatchOutcome, FailedUpload};
pub use range::InclusiveRange;

#[cfg(test)]
pub mod test_utils;

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Where the bytes of an upload come from
#[derive(Debug, Clone)]
pub enum UploadSource {
    /// A file on disk, read part by part
    File(PathBuf),
    /// Bytes already in memory
    Bytes(Bytes),
}

/// Everything needed to upload one object
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// The name the object will carry in the store
    pub object_name: String,
    pub source: UploadSource,
    /// The declared MIME type of the contents
    ///
    /// Passed through to the store as is. The engine never sniffs
    /// the bytes to derive one.
    pub mime_type: String,
    /// A precomputed hash over the complete contents
    ///
    /// If not set the contents are hashed before the upload starts.
    /// Callers running the bytes through a pipeline beforehand
    /// usually already know the hash.
    pub content_hash: Option<ContentHash>,
}

impl UploadRequest {
    pub fn from_file<N: Into<String>, P: Into<PathBuf>>(object_name: N, path: P) -> Self {
        Self {
            object_name: object_name.into(),
            source: UploadSource::File(path.into()),
            mime_type: DEFAULT_MIME_TYPE.to_owned(),
            content_hash: None,
        }
    }

    pub fn from_bytes<N: Into<String>, B: Into<Bytes>>(object_name: N, bytes: B) -> Self {
        Self {
            object_name: object_name.into(),
            source: UploadSource::Bytes(bytes.into()),
            mime_type: DEFAULT_MIME_TYPE.to_owned(),
            content_hash: None,
        }
    }

    pub fn mime_type<M: Into<String>>(mut self, mime_type: M) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    pub fn content_hash(mut self, hash: ContentHash) -> Self {
        self.content_hash = Some(hash);
        self
    }
}

/// What a successful upload leaves behind
///
/// `remote_id` and `content_hash` are what a caller records to
/// retrieve and verify the object later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub remote_id: RemoteObjectId,
    pub content_hash: ContentHash,
    pub part_count: u64,
    pub bytes_transferred: u64,
}

/// What a successful download leaves behind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// Hash over the bytes as written to the sink
    pub content_hash: ContentHash,
    pub bytes_written: u64,
    pub part_count: u64,
}

/// The part lifting transfer engine
///
/// Uploads and downloads objects by splitting them into parts
/// which are transferred concurrently.
pub struct Partlift<C, PF = ()> {
    client: C,
    config: Config,
    probe_factory: Option<Arc<PF>>,
}

impl<C: ObjectClient, PF: ProbeFactory> Clone for Partlift<C, PF> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            config: self.config.clone(),
            probe_factory: self.probe_factory.clone(),
        }
    }
}

impl<C> Partlift<C>
where
    C: ObjectClient,
{
    /// Create a new transfer engine.
    ///
    /// Fails if the [Config] is not valid.
    pub fn new(client: C, config: Config) -> Result<Partlift<C, ()>, AnyError> {
        let config = config.validated()?;
        Ok(Partlift {
            client,
            config,
            probe_factory: None,
        })
    }
}

impl<C, PF> Partlift<C, PF>
where
    C: ObjectClient,
    PF: ProbeFactory,
{
    /// Set a factory for [Probe]s which will add a [Probe] to each transfer
    ///
    /// The [ProbeFactory] is intended to share state with the [Probe] to
    /// add instrumentation
    pub fn probe_factory<PPF: ProbeFactory>(self, factory: PPF) -> Partlift<C, PPF> {
        self.probe_factory_shared(Arc::new(factory))
    }

    /// Set a factory for [Probe]s which will add a [Probe] to each transfer
    pub fn probe_factory_shared<PPF: ProbeFactory>(self, factory: Arc<PPF>) -> Partlift<C, PPF> {
        Partlift {
            client: self.client,
            config: self.config,
            probe_factory: Some(factory),
        }
    }

    /// Upload one object
    pub async fn upload(&self, request: UploadRequest) -> Result<UploadOutcome, TransferError> {
        let probe = self.probe_for(&request.object_name, None);
        machinery::upload_object(self.client.clone(), self.config.clone(), request, probe).await
    }

    /// Upload one object with a [Probe] for this transfer only
    pub async fn upload_with_probe(
        &self,
        request: UploadRequest,
        probe: Arc<dyn Probe>,
    ) -> Result<UploadOutcome, TransferError> {
        let probe = self.probe_for(&request.object_name, Some(probe));
        machinery::upload_object(self.client.clone(), self.config.clone(), request, probe).await
    }

    /// Download one object into the given sink
    pub async fn download<I, W>(&self, id: I, sink: &mut W) -> Result<DownloadOutcome, TransferError>
    where
        I: Into<RemoteObjectId>,
        W: AsyncWrite + Unpin,
    {
        let id = id.into();
        let probe = self.probe_for(&id, None);
        machinery::download_object(self.client.clone(), self.config.clone(), id, sink, probe).await
    }

    /// Download one object with a [Probe] for this transfer only
    pub async fn download_with_probe<I, W>(
        &self,
        id: I,
        sink: &mut W,
        probe: Arc<dyn Probe>,
    ) -> Result<DownloadOutcome, TransferError>
    where
        I: Into<RemoteObjectId>,
        W: AsyncWrite + Unpin,
    {
        let id = id.into();
        let probe = self.probe_for(&id, Some(probe));
        machinery::download_object(self.client.clone(), self.config.clone(), id, sink, probe).await
    }

    /// Download one object into a freshly created file
    pub async fn download_to_file<I, P>(
        &self,
        id: I,
        path: P,
    ) -> Result<DownloadOutcome, TransferError>
    where
        I: Into<RemoteObjectId>,
        P: Into<PathBuf>,
    {
        let path = path.into();
        let file = tokio::fs::File::create(&path).await.map_err(|err| {
            TransferError::new_io(format!("cannot create '{}'", path.display())).with_source(err)
        })?;
        let mut sink = tokio::io::BufWriter::new(file);
        self.download(id, &mut sink).await
    }

    /// Get the metadata of an object
    pub async fn get_object_info<I: Into<RemoteObjectId>>(
        &self,
        id: I,
    ) -> Result<ObjectInfo, TransferError> {
        self.client.get_object_info(id.into()).await
    }

    fn probe_for(
        &self,
        name: &dyn fmt::Display,
        per_transfer: Option<Arc<dyn Probe>>,
    ) -> ProbeInternal<PF::Probe> {
        match (&self.probe_factory, per_transfer) {
            (None, None) => ProbeInternal::Off,
            (Some(factory), None) => ProbeInternal::One(factory.make(name)),
            (None, Some(probe)) => ProbeInternal::OneDyn(probe),
            (Some(factory), Some(probe)) => ProbeInternal::Two(factory.make(name), probe),
        }
    }
}
