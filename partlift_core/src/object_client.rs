//! Abstraction over the remote object store
//!
//! Implementations provide the actual network calls for uploads
//! and downloads. The transfer machinery only talks to this trait.

use std::fmt;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::{
    errors::TransferError,
    integrity::{ContentHash, PartHash},
    InclusiveRange,
};

/// Identifies an object within the remote store
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteObjectId(String);

impl RemoteObjectId {
    pub fn new<T: Into<String>>(id: T) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for RemoteObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for RemoteObjectId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for RemoteObjectId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Metadata of a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub id: RemoteObjectId,
    pub name: String,
    pub size_in_bytes: u64,
    pub content_hash: Option<ContentHash>,
}

/// Parameters for creating a new object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewObjectParams {
    /// The name the object will carry in the store
    pub object_name: String,
    /// The MIME type declared by the caller, passed through as is
    pub mime_type: String,
    /// Hash over the complete object contents
    pub content_hash: ContentHash,
    /// The total size of the object in bytes
    pub total_size: u64,
}

/// A destination a single worker uploads parts to
///
/// Targets carry their own credentials which can expire
/// independently of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartUploadTarget {
    pub upload_url: String,
    pub upload_token: String,
}

/// A successfully uploaded part as reported back when
/// finishing a large object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedPart {
    pub part_number: u32,
    pub part_hash: PartHash,
}

/// Part size bounds negotiated with the remote store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartSizeHints {
    pub min_part_size: u64,
    pub recommended_part_size: u64,
}

/// A client to the remote object store
///
/// All methods return futures which are independent of the
/// lifetime of the client itself so that they can be freely
/// moved into spawned tasks.
pub trait ObjectClient: Clone + Send + Sync + 'static {
    /// Query the metadata of an object
    fn get_object_info(
        &self,
        id: RemoteObjectId,
    ) -> BoxFuture<'static, Result<ObjectInfo, TransferError>>;

    /// Download the given byte range of an object
    fn download_range(
        &self,
        id: RemoteObjectId,
        range: InclusiveRange,
    ) -> BoxFuture<'static, Result<Bytes, TransferError>>;

    /// Upload a complete object in a single call
    ///
    /// Used for objects too small to be worth splitting.
    fn upload_object(
        &self,
        params: NewObjectParams,
        bytes: Bytes,
    ) -> BoxFuture<'static, Result<RemoteObjectId, TransferError>>;

    /// Register a new large object and get its id
    ///
    /// The object only becomes visible once
    /// [finish_large_object](ObjectClient::finish_large_object)
    /// succeeds.
    fn start_large_object(
        &self,
        params: NewObjectParams,
    ) -> BoxFuture<'static, Result<RemoteObjectId, TransferError>>;

    /// Acquire an upload destination for part uploads
    ///
    /// Each concurrent worker needs its own target.
    fn part_upload_target(
        &self,
        object_id: RemoteObjectId,
    ) -> BoxFuture<'static, Result<PartUploadTarget, TransferError>>;

    /// Upload a single part to the given target
    fn upload_part(
        &self,
        target: PartUploadTarget,
        part_number: u32,
        part_hash: PartHash,
        bytes: Bytes,
    ) -> BoxFuture<'static, Result<(), TransferError>>;

    /// Combine the uploaded parts into the finished object
    fn finish_large_object(
        &self,
        id: RemoteObjectId,
        parts: Vec<FinishedPart>,
    ) -> BoxFuture<'static, Result<(), TransferError>>;

    /// The part size bounds of this store if it imposes any
    fn part_size_hints(&self) -> BoxFuture<'static, Result<Option<PartSizeHints>, TransferError>>;

    /// Re-authorize after a token was rejected
    ///
    /// Implementations backed by a session should collapse
    /// concurrent calls into a single refresh.
    fn refresh_auth(&self) -> BoxFuture<'static, Result<(), TransferError>>;
}

mod in_memory {
    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
    };

    use bytes::Bytes;
    use futures::{
        future::{self, BoxFuture},
        FutureExt,
    };

    use crate::{
        errors::TransferError,
        integrity::{self, ContentHash, PartHash},
        InclusiveRange,
    };

    use super::{
        FinishedPart, NewObjectParams, ObjectClient, ObjectInfo, PartSizeHints, PartUploadTarget,
        RemoteObjectId,
    };

    #[derive(Debug)]
    struct StoredObject {
        name: String,
        bytes: Bytes,
        content_hash: ContentHash,
    }

    #[derive(Debug)]
    struct PendingLargeObject {
        params: NewObjectParams,
        parts: HashMap<u32, (PartHash, Bytes)>,
    }

    #[derive(Debug, Default)]
    struct Store {
        objects: HashMap<RemoteObjectId, StoredObject>,
        pending: HashMap<RemoteObjectId, PendingLargeObject>,
        next_id: u64,
    }

    /// An [ObjectClient] keeping all objects in memory
    ///
    /// Mostly useful for testing and experimentation. Also used
    /// in the documentation examples.
    #[derive(Debug, Clone)]
    pub struct InMemoryObjectClient {
        store: Arc<Mutex<Store>>,
        part_size_hints: Option<PartSizeHints>,
    }

    impl Default for InMemoryObjectClient {
        fn default() -> Self {
            Self::new()
        }
    }

    impl InMemoryObjectClient {
        pub fn new() -> Self {
            Self {
                store: Arc::new(Mutex::new(Store::default())),
                part_size_hints: None,
            }
        }

        /// Let the client report the given part size bounds
        pub fn with_part_size_hints(mut self, hints: PartSizeHints) -> Self {
            self.part_size_hints = Some(hints);
            self
        }

        /// Put an object directly into the store
        pub fn insert_object<N: Into<String>, B: Into<Bytes>>(
            &self,
            name: N,
            bytes: B,
        ) -> RemoteObjectId {
            let bytes = bytes.into();
            let content_hash = integrity::hash_bytes(&bytes);
            let mut store = self.lock_store();
            let id = next_object_id(&mut store);
            store.objects.insert(
                id.clone(),
                StoredObject {
                    name: name.into(),
                    bytes,
                    content_hash,
                },
            );
            id
        }

        /// Get the raw bytes of a stored object
        pub fn object_bytes(&self, id: &RemoteObjectId) -> Option<Bytes> {
            self.lock_store().objects.get(id).map(|o| o.bytes.clone())
        }

        fn lock_store(&self) -> std::sync::MutexGuard<'_, Store> {
            match self.store.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            }
        }
    }

    fn next_object_id(store: &mut Store) -> RemoteObjectId {
        store.next_id += 1;
        RemoteObjectId::new(format!("in-memory-{}", store.next_id))
    }

    impl ObjectClient for InMemoryObjectClient {
        fn get_object_info(
            &self,
            id: RemoteObjectId,
        ) -> BoxFuture<'static, Result<ObjectInfo, TransferError>> {
            let store = self.lock_store();
            let result = match store.objects.get(&id) {
                Some(stored) => Ok(ObjectInfo {
                    id: id.clone(),
                    name: stored.name.clone(),
                    size_in_bytes: stored.bytes.len() as u64,
                    content_hash: Some(stored.content_hash.clone()),
                }),
                None => Err(TransferError::new_not_found(format!(
                    "no object with id '{id}'"
                ))),
            };
            future::ready(result).boxed()
        }

        fn download_range(
            &self,
            id: RemoteObjectId,
            range: InclusiveRange,
        ) -> BoxFuture<'static, Result<Bytes, TransferError>> {
            let store = self.lock_store();
            let result = match store.objects.get(&id) {
                Some(stored) => {
                    if range.end_incl() >= stored.bytes.len() as u64 {
                        Err(TransferError::new_invalid_plan(format!(
                            "range {} exceeds object size {}",
                            range,
                            stored.bytes.len()
                        )))
                    } else {
                        Ok(stored
                            .bytes
                            .slice(range.start() as usize..=range.end_incl() as usize))
                    }
                }
                None => Err(TransferError::new_not_found(format!(
                    "no object with id '{id}'"
                ))),
            };
            future::ready(result).boxed()
        }

        fn upload_object(
            &self,
            params: NewObjectParams,
            bytes: Bytes,
        ) -> BoxFuture<'static, Result<RemoteObjectId, TransferError>> {
            let mut store = self.lock_store();
            let id = next_object_id(&mut store);
            store.objects.insert(
                id.clone(),
                StoredObject {
                    name: params.object_name,
                    bytes,
                    content_hash: params.content_hash,
                },
            );
            future::ready(Ok(id)).boxed()
        }

        fn start_large_object(
            &self,
            params: NewObjectParams,
        ) -> BoxFuture<'static, Result<RemoteObjectId, TransferError>> {
            let mut store = self.lock_store();
            let id = next_object_id(&mut store);
            store.pending.insert(
                id.clone(),
                PendingLargeObject {
                    params,
                    parts: HashMap::new(),
                },
            );
            future::ready(Ok(id)).boxed()
        }

        fn part_upload_target(
            &self,
            object_id: RemoteObjectId,
        ) -> BoxFuture<'static, Result<PartUploadTarget, TransferError>> {
            let store = self.lock_store();
            let result = if store.pending.contains_key(&object_id) {
                Ok(PartUploadTarget {
                    upload_url: format!("in-memory://{object_id}"),
                    upload_token: "in-memory-token".to_owned(),
                })
            } else {
                Err(TransferError::new_not_found(format!(
                    "no pending large object with id '{object_id}'"
                )))
            };
            future::ready(result).boxed()
        }

        fn upload_part(
            &self,
            target: PartUploadTarget,
            part_number: u32,
            part_hash: PartHash,
            bytes: Bytes,
        ) -> BoxFuture<'static, Result<(), TransferError>> {
            let id = match target.upload_url.strip_prefix("in-memory://") {
                Some(id) => RemoteObjectId::new(id),
                None => {
                    return future::ready(Err(TransferError::new_fatal(format!(
                        "invalid upload url '{}'",
                        target.upload_url
                    ))))
                    .boxed()
                }
            };

            let mut store = self.lock_store();
            let result = match store.pending.get_mut(&id) {
                Some(pending) => {
                    if integrity::part_hash(&bytes) != part_hash {
                        Err(TransferError::new_transient(format!(
                            "hash mismatch for part {part_number}"
                        )))
                    } else {
                        pending.parts.insert(part_number, (part_hash, bytes));
                        Ok(())
                    }
                }
                None => Err(TransferError::new_not_found(format!(
                    "no pending large object with id '{id}'"
                ))),
            };
            future::ready(result).boxed()
        }

        fn finish_large_object(
            &self,
            id: RemoteObjectId,
            parts: Vec<FinishedPart>,
        ) -> BoxFuture<'static, Result<(), TransferError>> {
            let mut store = self.lock_store();

            let mut pending = match store.pending.remove(&id) {
                Some(pending) => pending,
                None => {
                    return future::ready(Err(TransferError::new_not_found(format!(
                        "no pending large object with id '{id}'"
                    ))))
                    .boxed()
                }
            };

            let mut assembled = Vec::with_capacity(pending.params.total_size as usize);
            for (idx, finished) in parts.iter().enumerate() {
                let expected = idx as u32 + 1;
                if finished.part_number != expected {
                    return future::ready(Err(TransferError::new_fatal(format!(
                        "expected part {} but got part {}",
                        expected, finished.part_number
                    ))))
                    .boxed();
                }

                match pending.parts.remove(&finished.part_number) {
                    Some((stored_hash, bytes)) if stored_hash == finished.part_hash => {
                        assembled.extend_from_slice(&bytes)
                    }
                    Some(_) => {
                        return future::ready(Err(TransferError::new_integrity(format!(
                            "hash mismatch for part {}",
                            finished.part_number
                        ))))
                        .boxed()
                    }
                    None => {
                        return future::ready(Err(TransferError::new_fatal(format!(
                            "part {} was never uploaded",
                            finished.part_number
                        ))))
                        .boxed()
                    }
                }
            }

            if assembled.len() as u64 != pending.params.total_size {
                return future::ready(Err(TransferError::new_integrity(format!(
                    "assembled {} bytes but expected {}",
                    assembled.len(),
                    pending.params.total_size
                ))))
                .boxed();
            }

            let bytes = Bytes::from(assembled);
            if integrity::hash_bytes(&bytes) != pending.params.content_hash {
                return future::ready(Err(TransferError::new_integrity(
                    "content hash mismatch on finished object",
                )))
                .boxed();
            }

            store.objects.insert(
                id,
                StoredObject {
                    name: pending.params.object_name,
                    bytes,
                    content_hash: pending.params.content_hash,
                },
            );

            future::ready(Ok(())).boxed()
        }

        fn part_size_hints(
            &self,
        ) -> BoxFuture<'static, Result<Option<PartSizeHints>, TransferError>> {
            future::ready(Ok(self.part_size_hints)).boxed()
        }

        fn refresh_auth(&self) -> BoxFuture<'static, Result<(), TransferError>> {
            future::ready(Ok(())).boxed()
        }
    }
}

pub use in_memory::InMemoryObjectClient;
