//! Streamed JSON array responses

use axum::body::{Body, Bytes};
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use futures::{future, stream, StreamExt, TryStreamExt};
use paasbill_common::Result;
use paasbill_eventstore::EventRows;
use serde::Serialize;
use tracing::error;

/// Writes `rows` as a JSON array.
///
/// The status is only decided once the first row (or the end of the rows) is
/// available, so an error setting up the query still gets an error response.
/// A later failure aborts the body, leaving the client with truncated JSON
/// rather than a well formed partial result.
pub async fn json_array<T>(mut rows: EventRows<T>) -> std::result::Result<Response, crate::ApiError>
where
    T: Serialize + Send + 'static,
{
    let first = match rows.next().await {
        Some(Ok(row)) => Some(row),
        Some(Err(err)) => return Err(err.into()),
        None => None,
    };

    let items = stream::iter(first.map(Ok))
        .chain(rows.into_stream())
        .enumerate()
        .map(|(i, row): (usize, Result<T>)| -> Result<Bytes> {
            let mut buf = if i == 0 { Vec::new() } else { b",\n".to_vec() };
            serde_json::to_writer(&mut buf, &row?)?;
            Ok(Bytes::from(buf))
        });
    let body = stream::once(future::ready(Ok(Bytes::from_static(b"[\n"))))
        .chain(items)
        .chain(stream::once(future::ready(Ok(Bytes::from_static(b"\n]\n")))))
        .inspect_err(|err| error!(error = %err, "aborting streamed response"));

    Ok(([(CONTENT_TYPE, "application/json; charset=UTF-8")], Body::from_stream(body)).into_response())
}
