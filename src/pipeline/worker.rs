use crate::config::PipelineConfig;
use crate::storage::page_views;
use crate::types::ProcessedPageView;
use deadpool_sqlite::Pool;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time;

/// Pipeline worker: consumes page views from the channel, batches them,
/// and flushes to SQLite on batch size or time trigger.
pub async fn run_worker(
    mut rx: mpsc::Receiver<ProcessedPageView>,
    pool: Pool,
    config: PipelineConfig,
) {
    let batch_size = config.flush_batch_size.max(1);
    let mut buffer: Vec<ProcessedPageView> = Vec::with_capacity(batch_size);
    let flush_interval = Duration::from_secs(config.flush_interval_secs.max(1));
    let mut flush_timer = time::interval(flush_interval);
    flush_timer.tick().await; // skip first immediate tick

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Some(view) => {
                        buffer.push(view);
                        if buffer.len() >= batch_size {
                            flush(&pool, &mut buffer).await;
                        }
                    }
                    None => {
                        // Channel closed - drain remaining
                        tracing::info!("tracking channel closed, draining buffer");
                        if !buffer.is_empty() {
                            flush(&pool, &mut buffer).await;
                        }
                        return;
                    }
                }
            }
            _ = flush_timer.tick() => {
                if !buffer.is_empty() {
                    flush(&pool, &mut buffer).await;
                }
            }
        }
    }
}

async fn flush(pool: &Pool, buffer: &mut Vec<ProcessedPageView>) {
    let views = std::mem::take(buffer);
    let count = views.len();

    // initial attempt + one retry, then the batch is dropped
    for attempt in 0..2u8 {
        match page_views::write_page_views(pool, views.clone()).await {
            Ok(()) => return,
            Err(e) if attempt == 0 => {
                tracing::warn!(error = %e, count, "page view flush failed, retrying in 500ms");
                time::sleep(Duration::from_millis(500)).await;
            }
            Err(e) => {
                tracing::error!(error = %e, count, "page view flush retry failed, batch dropped");
            }
        }
    }
}
