//! Response model returned by the pipeline

/// Response handed back to the caller: status, headers and a streaming body.
///
/// The caller owns it and must consume or drop it to release the connection.
pub type FetchResponse = reqwest::Response;

/// Upper bound on bytes read when discarding a rejected response
pub const DRAIN_LIMIT: usize = 32 * 1024;

/// Read and discard at most `limit` bytes of the body, then release the response.
///
/// Returns the number of bytes read. Body errors end the drain early; the
/// response is dropped either way.
pub async fn drain_body(mut response: FetchResponse, limit: usize) -> usize {
    let mut drained = 0;
    while drained < limit {
        match response.chunk().await {
            Ok(Some(chunk)) => drained += chunk.len(),
            Ok(None) | Err(_) => break,
        }
    }
    drained
}
