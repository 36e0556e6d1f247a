//! # Partlift for B2 style object stores
//!
//! An [ObjectClient] implementation talking to a BackBlaze B2 style
//! HTTP API with token based sessions, per worker part upload URLs
//! and range downloads.
//!
//! ```rust, no_run
//! use partlift_b2::{B2Client, B2Credentials};
//! use partlift_b2::config::Config;
//! use partlift_b2::UploadRequest;
//!
//! # async {
//! let credentials = B2Credentials::new(
//!     "https://auth.example.com",
//!     "key-id",
//!     "application-key",
//!     "bucket-id",
//! );
//!
//! let partlift = B2Client::partlift(credentials, Config::default()).unwrap();
//!
//! let uploaded = partlift
//!     .upload(UploadRequest::from_file("backups/photos.tar", "/tmp/photos.tar"))
//!     .await
//!     .unwrap();
//! println!("stored as {}", uploaded.remote_id);
//! # };
//! # ()
//! ```
use std::sync::Arc;

use anyhow::Error as AnyError;
use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt};
use reqwest::{
    header::{HeaderMap, CONTENT_LENGTH, CONTENT_TYPE, RANGE},
    Client, Response,
};
use tracing::debug;

use partlift_core::config::Config;
use partlift_core::errors::{http_status_to_error, TransferError};
use partlift_core::integrity::{ContentHash, PartHash};
use partlift_core::object_client::{
    FinishedPart, NewObjectParams, ObjectClient, ObjectInfo, PartSizeHints, PartUploadTarget,
    RemoteObjectId,
};
use partlift_core::session::{AuthSession, AuthState, Authorizer};
pub use partlift_core::*;

mod wire;

use wire::{
    AuthorizeResponse, FinishLargeObjectRequest, ObjectCreatedResponse, PartUploadTargetResponse,
    StartLargeObjectRequest, WirePart,
};

/// Header carrying the 1 based part number of a part upload
pub const PART_NUMBER_HEADER: &str = "x-part-number";
/// Header carrying the hash of a body (part or whole object)
pub const CONTENT_HASH_HEADER: &str = "x-content-hash";
/// Header carrying the object name on single call uploads
pub const OBJECT_NAME_HEADER: &str = "x-object-name";

/// Everything needed to authorize against the store
#[derive(Debug, Clone)]
pub struct B2Credentials {
    pub auth_url: String,
    pub key_id: String,
    pub application_key: String,
    pub bucket_id: String,
}

impl B2Credentials {
    pub fn new<A, K, S, B>(auth_url: A, key_id: K, application_key: S, bucket_id: B) -> Self
    where
        A: Into<String>,
        K: Into<String>,
        S: Into<String>,
        B: Into<String>,
    {
        Self {
            auth_url: auth_url.into(),
            key_id: key_id.into(),
            application_key: application_key.into(),
            bucket_id: bucket_id.into(),
        }
    }
}

/// Performs the authorize call with the application key pair
struct B2Authorizer {
    http: Client,
    credentials: B2Credentials,
}

impl Authorizer for B2Authorizer {
    fn authorize(&self) -> BoxFuture<'static, Result<AuthState, TransferError>> {
        let http = self.http.clone();
        let credentials = self.credentials.clone();
        async move {
            let response = http
                .get(format!("{}/api/v1/authorize", credentials.auth_url))
                .basic_auth(&credentials.key_id, Some(&credentials.application_key))
                .send()
                .await
                .map_err(reqwest_error_to_transfer_error)?;
            let response = check_status(response).await?;

            let authorized: AuthorizeResponse = response
                .json()
                .await
                .map_err(reqwest_error_to_transfer_error)?;

            debug!("authorized against {}", authorized.api_url);
            Ok(AuthState {
                auth_token: authorized.authorization_token,
                api_url: authorized.api_url,
                download_url: authorized.download_url,
                part_size_hints: Some(PartSizeHints {
                    min_part_size: authorized.absolute_minimum_part_size,
                    recommended_part_size: authorized.recommended_part_size,
                }),
            })
        }
        .boxed()
    }
}

/// An [ObjectClient] over a B2 style HTTP API
#[derive(Clone)]
pub struct B2Client {
    http: Client,
    session: AuthSession,
    bucket_id: Arc<String>,
}

impl B2Client {
    pub fn new(credentials: B2Credentials) -> Result<Self, AnyError> {
        let http = Client::builder().build()?;
        Ok(Self::with_http_client(credentials, http))
    }

    pub fn with_http_client(credentials: B2Credentials, http: Client) -> Self {
        let bucket_id = Arc::new(credentials.bucket_id.clone());
        let session = AuthSession::new(B2Authorizer {
            http: http.clone(),
            credentials,
        });
        Self {
            http,
            session,
            bucket_id,
        }
    }

    /// Create a transfer engine from this client and the given [Config]
    pub fn partlift(
        credentials: B2Credentials,
        config: Config,
    ) -> Result<Partlift<B2Client>, AnyError> {
        Partlift::new(B2Client::new(credentials)?, config)
    }

    async fn state(&self) -> Result<Arc<AuthState>, TransferError> {
        self.session.current().await
    }
}

impl ObjectClient for B2Client {
    fn get_object_info(
        &self,
        id: RemoteObjectId,
    ) -> BoxFuture<'static, Result<ObjectInfo, TransferError>> {
        let me = self.clone();
        async move {
            let state = me.state().await?;
            let response = me
                .http
                .head(format!("{}/object/{}", state.download_url, id))
                .bearer_auth(&state.auth_token)
                .send()
                .await
                .map_err(reqwest_error_to_transfer_error)?;
            let response = check_status(response).await?;

            let headers = response.headers();
            let size_in_bytes = parse_content_length(headers)?;
            let content_hash = header_as_str(headers, CONTENT_HASH_HEADER)
                .ok()
                .map(ContentHash::from_hex);
            let name = header_as_str(headers, OBJECT_NAME_HEADER)
                .unwrap_or_default()
                .to_owned();

            Ok(ObjectInfo {
                id,
                name,
                size_in_bytes,
                content_hash,
            })
        }
        .boxed()
    }

    fn download_range(
        &self,
        id: RemoteObjectId,
        range: InclusiveRange,
    ) -> BoxFuture<'static, Result<Bytes, TransferError>> {
        let me = self.clone();
        async move {
            let state = me.state().await?;
            let response = me
                .http
                .get(format!("{}/object/{}", state.download_url, id))
                .bearer_auth(&state.auth_token)
                .header(RANGE, range.http_bytes_range_value())
                .send()
                .await
                .map_err(reqwest_error_to_transfer_error)?;
            let response = check_status(response).await?;

            response
                .bytes()
                .await
                .map_err(reqwest_error_to_transfer_error)
        }
        .boxed()
    }

    fn upload_object(
        &self,
        params: NewObjectParams,
        bytes: Bytes,
    ) -> BoxFuture<'static, Result<RemoteObjectId, TransferError>> {
        let me = self.clone();
        async move {
            let state = me.state().await?;
            let response = me
                .http
                .post(format!(
                    "{}/bucket/{}/object",
                    state.api_url,
                    me.bucket_id.as_str()
                ))
                .bearer_auth(&state.auth_token)
                .header(OBJECT_NAME_HEADER, params.object_name.as_str())
                .header(CONTENT_HASH_HEADER, params.content_hash.as_str())
                .header(CONTENT_TYPE, params.mime_type.as_str())
                .body(bytes)
                .send()
                .await
                .map_err(reqwest_error_to_transfer_error)?;
            let response = check_status(response).await?;

            let created: ObjectCreatedResponse = response
                .json()
                .await
                .map_err(reqwest_error_to_transfer_error)?;
            Ok(RemoteObjectId::new(created.object_id))
        }
        .boxed()
    }

    fn start_large_object(
        &self,
        params: NewObjectParams,
    ) -> BoxFuture<'static, Result<RemoteObjectId, TransferError>> {
        let me = self.clone();
        async move {
            let state = me.state().await?;
            let request = StartLargeObjectRequest {
                bucket_id: me.bucket_id.as_str().to_owned(),
                object_name: params.object_name,
                mime_type: params.mime_type,
                content_hash: params.content_hash.as_str().to_owned(),
                total_size: params.total_size,
            };
            let response = me
                .http
                .post(format!("{}/large-object", state.api_url))
                .bearer_auth(&state.auth_token)
                .json(&request)
                .send()
                .await
                .map_err(reqwest_error_to_transfer_error)?;
            let response = check_status(response).await?;

            let created: ObjectCreatedResponse = response
                .json()
                .await
                .map_err(reqwest_error_to_transfer_error)?;
            Ok(RemoteObjectId::new(created.object_id))
        }
        .boxed()
    }

    fn part_upload_target(
        &self,
        object_id: RemoteObjectId,
    ) -> BoxFuture<'static, Result<PartUploadTarget, TransferError>> {
        let me = self.clone();
        async move {
            let state = me.state().await?;
            let response = me
                .http
                .post(format!(
                    "{}/large-object/{}/upload-target",
                    state.api_url, object_id
                ))
                .bearer_auth(&state.auth_token)
                .send()
                .await
                .map_err(reqwest_error_to_transfer_error)?;
            let response = check_status(response).await?;

            let target: PartUploadTargetResponse = response
                .json()
                .await
                .map_err(reqwest_error_to_transfer_error)?;
            Ok(PartUploadTarget {
                upload_url: target.upload_url,
                upload_token: target.upload_token,
            })
        }
        .boxed()
    }

    fn upload_part(
        &self,
        target: PartUploadTarget,
        part_number: u32,
        part_hash: PartHash,
        bytes: Bytes,
    ) -> BoxFuture<'static, Result<(), TransferError>> {
        let me = self.clone();
        async move {
            // The upload target carries its own token
            let response = me
                .http
                .post(&target.upload_url)
                .bearer_auth(&target.upload_token)
                .header(PART_NUMBER_HEADER, part_number)
                .header(CONTENT_HASH_HEADER, part_hash.as_str())
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(bytes)
                .send()
                .await
                .map_err(reqwest_error_to_transfer_error)?;
            check_status(response).await?;
            Ok(())
        }
        .boxed()
    }

    fn finish_large_object(
        &self,
        id: RemoteObjectId,
        parts: Vec<FinishedPart>,
    ) -> BoxFuture<'static, Result<(), TransferError>> {
        let me = self.clone();
        async move {
            let state = me.state().await?;
            let request = FinishLargeObjectRequest {
                parts: parts
                    .into_iter()
                    .map(|part| WirePart {
                        part_number: part.part_number,
                        part_hash: part.part_hash.as_str().to_owned(),
                    })
                    .collect(),
            };
            let response = me
                .http
                .post(format!("{}/large-object/{}/finish", state.api_url, id))
                .bearer_auth(&state.auth_token)
                .json(&request)
                .send()
                .await
                .map_err(reqwest_error_to_transfer_error)?;
            check_status(response).await?;
            Ok(())
        }
        .boxed()
    }

    fn part_size_hints(&self) -> BoxFuture<'static, Result<Option<PartSizeHints>, TransferError>> {
        let me = self.clone();
        async move {
            let state = me.state().await?;
            Ok(state.part_size_hints)
        }
        .boxed()
    }

    fn refresh_auth(&self) -> BoxFuture<'static, Result<(), TransferError>> {
        let session = self.session.clone();
        async move {
            session.refresh().await?;
            Ok(())
        }
        .boxed()
    }
}

/// Turns a non success response into the matching [TransferError]
async fn check_status(response: Response) -> Result<Response, TransferError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response.text().await.unwrap_or_default();
    Err(http_status_to_error(status.as_u16(), &message))
}

fn parse_content_length(headers: &HeaderMap) -> Result<u64, TransferError> {
    let value = header_as_str(headers, CONTENT_LENGTH.as_str())?;
    value.parse().map_err(|_| {
        TransferError::new_other(format!("invalid content length header: '{value}'"))
    })
}

fn header_as_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, TransferError> {
    let value = headers
        .get(name)
        .ok_or_else(|| TransferError::new_other(format!("missing header '{name}'")))?;
    value
        .to_str()
        .map_err(|_| TransferError::new_other(format!("header '{name}' is not valid UTF-8")))
}

fn reqwest_error_to_transfer_error(err: reqwest::Error) -> TransferError {
    if let Some(status) = err.status() {
        return http_status_to_error(status.as_u16(), &err.to_string());
    }

    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        // Network level trouble is worth another attempt
        TransferError::new_transient(err.to_string()).with_source(err)
    } else {
        TransferError::new_other(err.to_string()).with_source(err)
    }
}
