//! Satellite service loop
//!
//! Receives controller messages from the channel boundary, runs them
//! through the dispatcher and answers with the combined responses.

use super::dispatcher::{CollectingSink, DeviceDispatcher};
use crate::domain::{ApiCallRc, NodeName, Resource, SatelliteMessage, Snapshot};
use crate::error::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct SatelliteService {
    node_name: NodeName,
    dispatcher: Arc<DeviceDispatcher>,
}

impl SatelliteService {
    pub fn new(node_name: NodeName, dispatcher: Arc<DeviceDispatcher>) -> Self {
        Self {
            node_name,
            dispatcher,
        }
    }

    pub fn node_name(&self) -> &NodeName {
        &self.node_name
    }

    pub fn dispatcher(&self) -> &Arc<DeviceDispatcher> {
        &self.dispatcher
    }

    /// Apply one batch and collect the per-resource responses.
    ///
    /// A full sync only counts as applied once its batch was dispatched;
    /// failures of single resources do not prevent that. An error is an
    /// implementation defect and is never turned into a response.
    pub async fn apply(
        &self,
        resources: &[Resource],
        snapshots: &[Snapshot],
        full_sync: bool,
    ) -> Result<ApiCallRc> {
        let sink = CollectingSink::new();
        let report = self.dispatcher.dispatch(resources, snapshots, &sink).await?;
        debug!(
            node = %self.node_name,
            resources = report.results.len(),
            full_sync,
            "Batch applied"
        );
        if full_sync {
            self.dispatcher.set_full_sync_applied();
        }
        Ok(sink.into_combined())
    }

    /// Answer one message; on error the reply is dropped unanswered
    pub async fn handle(&self, message: SatelliteMessage) -> Result<()> {
        let (reply, responses) = match message {
            SatelliteMessage::FullSync {
                resources,
                snapshots,
                reply,
            } => {
                info!(node = %self.node_name, resources = resources.len(), "Full sync received");
                (reply, self.apply(&resources, &snapshots, true).await?)
            }
            SatelliteMessage::ApplyResources {
                resources,
                snapshots,
                reply,
            } => (reply, self.apply(&resources, &snapshots, false).await?),
        };
        if reply.send(responses).is_err() {
            debug!(node = %self.node_name, "Controller stopped waiting for the response");
        }
        Ok(())
    }

    /// Serve `receiver` until it closes, `cancel` fires or a message fails
    /// with an implementation error
    pub async fn run(
        self: Arc<Self>,
        mut receiver: mpsc::Receiver<SatelliteMessage>,
        cancel: CancellationToken,
    ) -> Result<()> {
        info!(node = %self.node_name, "Satellite service started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = receiver.recv() => match message {
                    Some(message) => {
                        if let Err(err) = self.handle(message).await {
                            error!(node = %self.node_name, error = %err, "Satellite service aborted");
                            return Err(err);
                        }
                    }
                    None => break,
                },
            }
        }
        info!(node = %self.node_name, "Satellite service stopped");
        Ok(())
    }
}
