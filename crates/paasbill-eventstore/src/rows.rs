//! Streamed query results
//!
//! Each stream is backed by a spawned producer task that owns its read
//! transaction and pushes rows through a bounded channel. Dropping or
//! closing the [`EventRows`] stops the producer, which rolls the transaction
//! back.

use std::future::Future;

use futures::Stream;
use paasbill_common::{BillingError, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

/// Destination for rows produced by a query: a channel feeding an
/// [`EventRows`] reader, or an in-memory buffer
pub enum RowSink<T> {
    Channel(mpsc::Sender<Result<T>>),
    Collect(Vec<T>),
}

impl<T> RowSink<T> {
    pub fn collect() -> Self {
        RowSink::Collect(Vec::new())
    }

    /// Delivers one row. Fails with [`BillingError::Cancelled`] once the
    /// reader has gone away.
    pub async fn push(&mut self, item: T) -> Result<()> {
        match self {
            RowSink::Channel(tx) => tx.send(Ok(item)).await.map_err(|_| BillingError::Cancelled),
            RowSink::Collect(items) => {
                items.push(item);
                Ok(())
            }
        }
    }

    /// Rows buffered by a collecting sink; empty for a channel sink
    pub fn into_vec(self) -> Vec<T> {
        match self {
            RowSink::Channel(_) => Vec::new(),
            RowSink::Collect(items) => items,
        }
    }
}

/// Async cursor over query results
pub struct EventRows<T> {
    rx: mpsc::Receiver<Result<T>>,
    producer: JoinHandle<()>,
}

impl<T: Send + 'static> EventRows<T> {
    /// Spawns `producer` with a sink feeding this stream. An error returned by
    /// the producer is delivered as the last item.
    pub(crate) fn spawn<F, Fut>(buffer: usize, producer: F) -> Self
    where
        F: FnOnce(RowSink<T>) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let errors = tx.clone();
        let work = producer(RowSink::Channel(tx));
        let producer = tokio::spawn(async move {
            match work.await {
                Ok(()) => {}
                Err(BillingError::Cancelled) => debug!("Row reader went away"),
                Err(e) => {
                    let _ = errors.send(Err(e)).await;
                }
            }
        });
        Self { rx, producer }
    }

    /// Stream that yields `items` and ends
    pub fn from_vec(items: Vec<T>) -> Self {
        Self::spawn(items.len(), move |mut sink| async move {
            for item in items {
                sink.push(item).await?;
            }
            Ok(())
        })
    }

    /// Next row, `None` once the producer is done
    pub async fn next(&mut self) -> Option<Result<T>> {
        self.rx.recv().await
    }

    /// Stops the producer and discards anything buffered
    pub fn close(&mut self) {
        self.producer.abort();
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }

    /// Reads every remaining row, failing on the first error
    pub async fn collect(mut self) -> Result<Vec<T>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<T>> {
        // the producer ends on its own once the receiver is dropped
        ReceiverStream::new(self.rx)
    }
}
