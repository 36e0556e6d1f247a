//! Uploading many objects with a consecutive failure limit
//!
//! Individual uploads already retry their parts internally. This
//! module adds the caller level policy on top: a failed upload does
//! not stop the batch, but too many failed uploads in a row do.

use tracing::{info, warn};

use crate::{
    errors::TransferError,
    object_client::ObjectClient,
    probe::ProbeFactory,
    Partlift, UploadOutcome, UploadRequest,
};

/// What happened to each request of a batch
#[derive(Debug)]
pub struct BatchOutcome {
    pub succeeded: Vec<UploadOutcome>,
    pub failed: Vec<FailedUpload>,
}

/// A single upload which failed as a whole
#[derive(Debug)]
pub struct FailedUpload {
    pub object_name: String,
    pub error: TransferError,
}

/// Counts whole transfer failures in a row
#[derive(Debug)]
struct ConsecutiveFailures {
    limit: usize,
    current: usize,
}

impl ConsecutiveFailures {
    fn new(limit: usize) -> Self {
        Self { limit, current: 0 }
    }

    fn success(&mut self) {
        self.current = 0;
    }

    /// Returns an error once the limit is reached
    fn failure(&mut self) -> Result<(), TransferError> {
        self.current += 1;
        if self.current >= self.limit {
            Err(TransferError::new_consecutive_failures_exceeded(format!(
                "{} transfers failed in a row",
                self.current
            )))
        } else {
            Ok(())
        }
    }
}

impl<C, PF> Partlift<C, PF>
where
    C: ObjectClient,
    PF: ProbeFactory,
{
    /// Upload many objects one after another
    ///
    /// A failed upload is recorded and the batch continues with the
    /// next request. Once `max_consecutive_errors` uploads failed
    /// in a row the batch gives up. The partial [BatchOutcome] is
    /// not returned in that case since the caller has to treat the
    /// whole batch as failed anyway.
    pub async fn upload_many(
        &self,
        requests: Vec<UploadRequest>,
    ) -> Result<BatchOutcome, TransferError> {
        let mut failures =
            ConsecutiveFailures::new(self.config.max_consecutive_errors.into_inner());
        let mut outcome = BatchOutcome {
            succeeded: Vec::new(),
            failed: Vec::new(),
        };

        let n_requests = requests.len();
        for request in requests {
            let object_name = request.object_name.clone();
            match self.upload(request).await {
                Ok(uploaded) => {
                    failures.success();
                    outcome.succeeded.push(uploaded);
                }
                Err(error) => {
                    warn!(object_name = %object_name, "upload failed in batch: {error}");
                    outcome.failed.push(FailedUpload { object_name, error });
                    failures.failure()?;
                }
            }
        }

        info!(
            total = n_requests,
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "batch finished"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use crate::{config::Config, errors::TransferErrorKind, object_client::InMemoryObjectClient};

    use super::*;

    fn partlift(max_consecutive_errors: usize) -> Partlift<InMemoryObjectClient> {
        Partlift::new(
            InMemoryObjectClient::new(),
            Config::default().max_consecutive_errors(max_consecutive_errors),
        )
        .unwrap()
    }

    fn good(name: &str) -> UploadRequest {
        UploadRequest::from_bytes(name, &b"some payload"[..])
    }

    /// Zero bytes cannot be planned so the upload fails as a whole
    fn bad(name: &str) -> UploadRequest {
        UploadRequest::from_bytes(name, bytes::Bytes::new())
    }

    #[tokio::test]
    async fn all_good_requests_succeed() {
        let outcome = partlift(3)
            .upload_many(vec![good("a"), good("b"), good("c")])
            .await
            .unwrap();

        assert_eq!(outcome.succeeded.len(), 3);
        assert!(outcome.failed.is_empty());
    }

    #[tokio::test]
    async fn failures_below_the_limit_do_not_stop_the_batch() {
        let outcome = partlift(3)
            .upload_many(vec![good("a"), bad("b"), bad("c"), good("d"), bad("e")])
            .await
            .unwrap();

        assert_eq!(outcome.succeeded.len(), 2);
        assert_eq!(outcome.failed.len(), 3);
        assert_eq!(outcome.failed[0].object_name, "b");
    }

    #[tokio::test]
    async fn too_many_failures_in_a_row_abort_the_batch() {
        let err = partlift(2)
            .upload_many(vec![good("a"), bad("b"), bad("c"), good("d")])
            .await
            .unwrap_err();

        assert_eq!(err.kind(), TransferErrorKind::ConsecutiveFailuresExceeded);
    }

    #[tokio::test]
    async fn a_success_resets_the_failure_counter() {
        let outcome = partlift(2)
            .upload_many(vec![bad("a"), good("b"), bad("c"), good("d")])
            .await
            .unwrap();

        assert_eq!(outcome.succeeded.len(), 2);
        assert_eq!(outcome.failed.len(), 2);
    }
}
