//! In order reassembly of downloaded parts
//!
//! The pool completes parts in arbitrary order but the sink must be
//! written strictly from part 1 upward. Parts arriving early are
//! buffered until the gap before them is filled, which bounds the
//! buffer to "completed early but not yet writable".

use std::collections::BTreeMap;

use bytes::Bytes;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc::UnboundedReceiver,
};
use tracing::{debug, trace};

use crate::{
    errors::TransferError,
    integrity::{ContentHash, StreamingHasher},
};

use super::pool::PartResult;

/// Drains part results into the sink in ascending part number order
///
/// Returns the hash over all written bytes and the number of bytes
/// written. The hash is computed in write order so it covers the
/// reassembled content exactly as it ends up in the sink.
pub(crate) async fn assemble<W: AsyncWrite + Unpin>(
    total_parts: u64,
    results: &mut UnboundedReceiver<PartResult<Bytes>>,
    sink: &mut W,
) -> Result<(ContentHash, u64), TransferError> {
    let mut next_expected: u64 = 1;
    let mut buffered: BTreeMap<u64, Bytes> = BTreeMap::new();
    let mut hasher = StreamingHasher::new();
    let mut bytes_written: u64 = 0;

    while next_expected <= total_parts {
        let result = match results.recv().await {
            Some(result) => result,
            None => {
                return Err(TransferError::new_other(format!(
                    "results channel closed while waiting for part {next_expected} of {total_parts}"
                )))
            }
        };

        let part_number = u64::from(result.part_number);
        if part_number < next_expected {
            return Err(TransferError::new_other(format!(
                "part {part_number} arrived twice"
            )));
        }

        if part_number != next_expected {
            trace!(part_number, next_expected, "buffering out of order part");
            if buffered.insert(part_number, result.payload).is_some() {
                return Err(TransferError::new_other(format!(
                    "part {part_number} arrived twice"
                )));
            }
            continue;
        }

        hasher.update(&result.payload);
        bytes_written += result.payload.len() as u64;
        sink.write_all(&result.payload)
            .await
            .map_err(|err| TransferError::new_io("failed to write part").with_source(err))?;
        next_expected += 1;

        while let Some(payload) = buffered.remove(&next_expected) {
            hasher.update(&payload);
            bytes_written += payload.len() as u64;
            sink.write_all(&payload)
                .await
                .map_err(|err| TransferError::new_io("failed to write part").with_source(err))?;
            next_expected += 1;
        }
    }

    sink.flush()
        .await
        .map_err(|err| TransferError::new_io("failed to flush sink").with_source(err))?;

    debug!(total_parts, bytes_written, "all parts written");
    Ok((hasher.finish(), bytes_written))
}

#[cfg(test)]
mod tests {
    use rand::seq::SliceRandom;
    use tokio::sync::mpsc;

    use crate::integrity;

    use super::*;

    fn results_for(parts: &[&[u8]]) -> Vec<PartResult<Bytes>> {
        parts
            .iter()
            .enumerate()
            .map(|(idx, payload)| PartResult {
                part_number: idx as u32 + 1,
                payload: Bytes::copy_from_slice(payload),
            })
            .collect()
    }

    #[tokio::test]
    async fn parts_in_order_are_written_through() {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        for result in results_for(&[b"aaa", b"bb", b"c"]) {
            sender.send(result).unwrap();
        }

        let mut sink = Vec::new();
        let (hash, bytes_written) = assemble(3, &mut receiver, &mut sink).await.unwrap();

        assert_eq!(sink, b"aaabbc");
        assert_eq!(bytes_written, 6);
        assert_eq!(hash, integrity::hash_bytes(b"aaabbc"));
    }

    #[tokio::test]
    async fn any_permutation_is_written_in_ascending_order() {
        let payloads: Vec<Vec<u8>> = (0u8..20).map(|n| vec![n; (n as usize % 5) + 1]).collect();
        let expected: Vec<u8> = payloads.iter().flatten().copied().collect();

        let mut rng = rand::thread_rng();
        for _ in 0..10 {
            let mut results: Vec<PartResult<Bytes>> = payloads
                .iter()
                .enumerate()
                .map(|(idx, payload)| PartResult {
                    part_number: idx as u32 + 1,
                    payload: Bytes::copy_from_slice(payload),
                })
                .collect();
            results.shuffle(&mut rng);

            let (sender, mut receiver) = mpsc::unbounded_channel();
            for result in results {
                sender.send(result).unwrap();
            }

            let mut sink = Vec::new();
            let (hash, _) = assemble(20, &mut receiver, &mut sink).await.unwrap();

            assert_eq!(sink, expected);
            assert_eq!(hash, integrity::hash_bytes(&expected));
        }
    }

    #[tokio::test]
    async fn writing_starts_before_all_parts_arrived() {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let mut results = results_for(&[b"aaa", b"bb", b"c"]);

        // Only part 1 available initially, the rest follows while
        // the assembler is already running
        sender.send(results.remove(0)).unwrap();
        let feeder = tokio::spawn(async move {
            for result in results {
                tokio::task::yield_now().await;
                sender.send(result).unwrap();
            }
        });

        let mut sink = Vec::new();
        let (_, bytes_written) = assemble(3, &mut receiver, &mut sink).await.unwrap();
        feeder.await.unwrap();

        assert_eq!(sink, b"aaabbc");
        assert_eq!(bytes_written, 6);
    }

    #[tokio::test]
    async fn a_duplicate_of_a_buffered_part_is_an_error() {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        for part_number in [2, 2, 1] {
            sender
                .send(PartResult {
                    part_number,
                    payload: Bytes::from_static(b"x"),
                })
                .unwrap();
        }

        let mut sink = Vec::new();
        let err = assemble(3, &mut receiver, &mut sink).await.unwrap_err();
        assert!(err.to_string().contains("twice"));
    }

    #[tokio::test]
    async fn a_duplicate_of_a_written_part_is_an_error() {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        for part_number in [1, 1] {
            sender
                .send(PartResult {
                    part_number,
                    payload: Bytes::from_static(b"x"),
                })
                .unwrap();
        }

        let mut sink = Vec::new();
        let err = assemble(3, &mut receiver, &mut sink).await.unwrap_err();
        assert!(err.to_string().contains("twice"));
    }

    #[tokio::test]
    async fn a_closed_channel_before_completion_is_an_error() {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        for result in results_for(&[b"aaa"]) {
            sender.send(result).unwrap();
        }
        drop(sender);

        let mut sink = Vec::new();
        let err = assemble(3, &mut receiver, &mut sink).await.unwrap_err();
        assert!(err.to_string().contains("closed"));
    }
}
