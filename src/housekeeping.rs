use crate::config::ParcelConfig;
use crate::reassembly::ReassemblyBuffer;
use crate::send_pipeline::SendPipeline;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::trace;

/// Periodic maintenance shared by both directions of the protocol: expiring
///  retained sent-message records, abandoning stalled incoming messages and
///  proactively requesting missing parcels.
pub struct Housekeeping {
    config: Arc<ParcelConfig>,
    send_pipeline: SendPipeline,
    reassembly: ReassemblyBuffer,
}

impl Housekeeping {
    pub fn new(
        config: Arc<ParcelConfig>,
        send_pipeline: SendPipeline,
        reassembly: ReassemblyBuffer,
    ) -> Housekeeping {
        Housekeeping {
            config,
            send_pipeline,
            reassembly,
        }
    }

    /// Runs the housekeeping loop until the returned handle is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.housekeeping_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }

    pub async fn run_once(&self) {
        trace!("housekeeping sweep");
        self.send_pipeline.expire_sent_records().await;
        self.reassembly.sweep().await;
    }
}
