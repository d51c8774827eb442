use crate::db::Storage;
use crate::metrics::{BATCH_SIZE, DB_FAILURES_TOTAL, INGEST_LATENCY_SECONDS};
use crate::model::{SensorBatch, StreamingFrame};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Storage path consumer: accumulates streaming frames and writes them in batches.
pub async fn run_batcher<S: Storage>(
    mut rx: mpsc::UnboundedReceiver<StreamingFrame>,
    storage: Arc<S>,
    max_batch: usize,
    shutdown: CancellationToken,
) {
    info!("Starting batcher with max_batch={}", max_batch);

    let max_batch = max_batch.max(1);
    let mut buffer: Vec<StreamingFrame> = Vec::with_capacity(max_batch);

    loop {
        tokio::select! {
            frame = rx.recv() => {
                match frame {
                    Some(frame) => {
                        buffer.push(frame);
                        BATCH_SIZE.set(buffer.len() as f64);

                        if buffer.len() >= max_batch {
                            flush_batch(storage.as_ref(), &mut buffer).await;
                        }
                    }
                    None => {
                        info!("Channel closed, flushing remaining batch");
                        flush_batch(storage.as_ref(), &mut buffer).await;
                        break;
                    }
                }
            }

            _ = shutdown.cancelled() => {
                info!("Shutdown requested, flushing remaining batch");
                flush_batch(storage.as_ref(), &mut buffer).await;
                break;
            }
        }
    }

    info!("Batcher stopped");
}

/// Writes the buffered frames and clears the buffer. A failed write drops the batch.
async fn flush_batch<S: Storage>(storage: &S, buffer: &mut Vec<StreamingFrame>) {
    if buffer.is_empty() {
        return;
    }

    let frames = buffer.len();
    let batches = group_by_sensor(buffer.drain(..));
    BATCH_SIZE.set(0.0);

    let samples: usize = batches.iter().map(|b| b.samples.len()).sum();
    debug!(
        "Flushing batch of {} frames ({} samples, {} sensors)",
        frames,
        samples,
        batches.len()
    );

    let start = Instant::now();
    match storage.save_batch(&batches).await {
        Ok(()) => {
            let elapsed = start.elapsed().as_secs_f64();
            INGEST_LATENCY_SECONDS.observe(elapsed);
            debug!("Batch stored in {:.3}s", elapsed);
        }
        Err(e) => {
            DB_FAILURES_TOTAL.inc();
            error!("Failed to store batch: {}", e);
            error!("{} samples from {} frames were dropped", samples, frames);
        }
    }
}

/// Concatenates samples per sensor, keeping arrival order within and across sensors.
pub fn group_by_sensor(frames: impl IntoIterator<Item = StreamingFrame>) -> Vec<SensorBatch> {
    let mut batches: Vec<SensorBatch> = Vec::new();
    for frame in frames {
        match batches.iter_mut().find(|b| b.sensor == frame.sensor) {
            Some(batch) => batch.samples.extend(frame.samples),
            None => batches.push(SensorBatch {
                sensor: frame.sensor,
                samples: frame.samples,
            }),
        }
    }
    batches
}
