use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use tracing::{debug, info, Instrument};
use crate::domain::TelemetryMessage;
use crate::service::processor::IngestionPipeline;

/// Single consumer between the transport event loop and the pipeline.
///
/// Messages are processed strictly in arrival order, one at a time. The event
/// loop only enqueues, so broker acknowledgments never wait on the database.
pub struct IngestWorker {
    pipeline: Arc<IngestionPipeline>,
}

impl IngestWorker {
    pub fn new(pipeline: Arc<IngestionPipeline>) -> Self {
        Self { pipeline }
    }

    /// Runs until every sender is dropped and the queue is drained.
    pub async fn run(self, mut receiver: Receiver<TelemetryMessage>) {
        info!("ingest worker started");

        while let Some(message) = receiver.recv().await {
            let span = tracing::info_span!("ingest", topic = %message.topic);
            async {
                debug!(payload_len = message.raw_payload.len(), retain = message.retain, "received message");
                self.pipeline.handle(&message).await;
            }
            .instrument(span)
            .await;
        }

        info!(
            received = self.pipeline.progress().received(),
            "ingest channel closed, worker stopped"
        );
    }
}
