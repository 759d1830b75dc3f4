//! Pass-through byte meter for streaming uploads.
//!
//! Chunks are forwarded unbuffered; once the running total passes the cap
//! the stream yields a [`SizeLimitExceeded`] error, which aborts whatever
//! pipeline is consuming it.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("the max file upload size is {limit} bytes")]
pub struct SizeLimitExceeded {
    pub limit: u64,
}

/// Effective cap for one upload: the client-reported length when it is a
/// positive value within the configured maximum, else the maximum itself.
pub fn upload_cap(content_length: Option<u64>, max: u64) -> u64 {
    match content_length {
        Some(len) if len > 0 && len <= max => len,
        _ => max,
    }
}

/// Wrap `stream`, counting bytes and failing once the total exceeds `limit`.
pub fn monitor_stream<S>(stream: S, limit: u64) -> impl Stream<Item = io::Result<Bytes>> + Send
where
    S: Stream<Item = io::Result<Bytes>> + Send,
{
    let mut total: u64 = 0;
    stream.map(move |chunk| {
        let chunk = chunk?;
        total = total.saturating_add(chunk.len() as u64);
        if total > limit {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                SizeLimitExceeded { limit },
            ));
        }
        Ok(chunk)
    })
}

/// True when a stream error came from the byte meter.
pub fn is_size_limit_error(err: &io::Error) -> bool {
    err.get_ref().is_some_and(|inner| inner.is::<SizeLimitExceeded>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn chunks(sizes: &[usize]) -> Vec<io::Result<Bytes>> {
        sizes
            .iter()
            .map(|n| Ok(Bytes::from(vec![0u8; *n])))
            .collect()
    }

    #[tokio::test]
    async fn forwards_chunks_under_the_cap() {
        let monitored = monitor_stream(stream::iter(chunks(&[10, 10, 10])), 30);
        let collected: Vec<_> = monitored.collect().await;
        assert_eq!(collected.len(), 3);
        assert!(collected.iter().all(|c| c.is_ok()));
    }

    #[tokio::test]
    async fn fails_the_chunk_that_crosses_the_cap() {
        let monitored = monitor_stream(stream::iter(chunks(&[60, 60])), 100);
        let collected: Vec<_> = monitored.collect().await;
        assert!(collected[0].is_ok());
        let err = collected[1].as_ref().unwrap_err();
        assert!(is_size_limit_error(err));
    }

    #[test]
    fn cap_is_min_of_reported_length_and_max() {
        assert_eq!(upload_cap(Some(100), 2048), 100);
        assert_eq!(upload_cap(Some(4096), 2048), 2048);
        assert_eq!(upload_cap(Some(0), 2048), 2048);
        assert_eq!(upload_cap(None, 2048), 2048);
    }
}
