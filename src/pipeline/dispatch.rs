use crate::queue::{chunk_job_id, ChunkJob, JobQueue, QueueError};
use crate::storage::{NewArticle, Publisher};

/// Splits `items` into `ceil(len / size)` ordered chunks; the last one may be short.
pub fn chunk<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let size = size.max(1);
    let mut chunks = Vec::with_capacity(items.len().div_ceil(size));
    let mut iter = items.into_iter().peekable();

    while iter.peek().is_some() {
        chunks.push(iter.by_ref().take(size).collect());
    }
    chunks
}

/// Submits a publisher's new articles as chunk jobs `{publisher_id}-chunk-{n}`.
///
/// Returns the number of jobs actually created; chunks whose id is still queued
/// from an earlier run are not submitted again.
pub async fn dispatch_to_queue(
    queue: &JobQueue,
    publisher: &Publisher,
    items: Vec<NewArticle>,
    chunk_size: usize,
) -> Result<usize, QueueError> {
    let chunks = chunk(items, chunk_size);
    let total_chunks = chunks.len();
    let mut created = 0;

    for (i, items) in chunks.into_iter().enumerate() {
        let chunk_index = i + 1;
        let job_id = chunk_job_id(publisher.id, chunk_index);
        let job = ChunkJob {
            publisher_id: publisher.id,
            publisher: publisher.title.clone(),
            chunk_index,
            total_chunks,
            items,
        };

        if queue.submit(&job_id, &job).await? {
            created += 1;
        }
    }

    tracing::debug!(
        publisher = %publisher.title,
        chunks = total_chunks,
        created,
        "Dispatched chunks to queue"
    );
    Ok(created)
}
