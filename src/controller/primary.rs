//! Primary role requests from satellites
//!
//! A satellite that wants to promote a resource asks the controller first.
//! The first node to claim a resource definition wins; the claim is stored
//! in the definition's properties and survives restarts.

use super::core_objects::CoreObjects;
use super::satellite_sync::combine_responses;
use crate::domain::model::keys;
use crate::domain::{
    all_nodes, AccessContext, AccessControlRef, AccessType, NodeName, ObjectKind, ResourceName,
    SatelliteUpdaterRef,
};
use crate::error::Result;
use crate::persistence::rows::columns;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Inbound request of a satellite to become primary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrimaryRequest {
    pub rsc_name: ResourceName,
    pub rsc_uuid: Uuid,
    /// The satellite already holds initialized data for the resource
    pub already_initialized: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum PrimaryResponse {
    Granted { skip_initial_sync: bool },
    Rejected { reason: String },
}

impl PrimaryResponse {
    fn rejected(reason: impl Into<String>) -> Self {
        PrimaryResponse::Rejected {
            reason: reason.into(),
        }
    }

    pub fn is_granted(&self) -> bool {
        matches!(self, PrimaryResponse::Granted { .. })
    }
}

pub struct PrimaryRequestHandler {
    core: Arc<CoreObjects>,
    access: AccessControlRef,
    updater: SatelliteUpdaterRef,
}

impl PrimaryRequestHandler {
    pub fn new(core: Arc<CoreObjects>, access: AccessControlRef, updater: SatelliteUpdaterRef) -> Self {
        Self {
            core,
            access,
            updater,
        }
    }

    /// Check the claim of `node` against the stored state and record it.
    ///
    /// A newly recorded claim is pushed to every satellite of the
    /// definition; delivery problems are logged, the grant stands.
    pub async fn handle(
        &self,
        peer_ctx: &AccessContext,
        node: &NodeName,
        request: PrimaryRequest,
    ) -> Result<PrimaryResponse> {
        let rsc_name = request.rsc_name.clone();
        self.access.require_access(
            peer_ctx,
            ObjectKind::Resource,
            rsc_name.display_value(),
            AccessType::Use,
        )?;

        let updated = {
            let mut dfns = self.core.write_rsc_dfns("primary request").await;
            let Some(rsc_dfn) = dfns.get_mut(&rsc_name) else {
                return Ok(PrimaryResponse::rejected(format!(
                    "Resource definition '{}' not found",
                    rsc_name
                )));
            };
            match rsc_dfn.resource(node) {
                Some(rsc) if rsc.uuid == request.rsc_uuid => {}
                Some(_) => {
                    warn!(rsc = %rsc_name, node = %node, "Primary request with outdated resource uuid");
                    return Ok(PrimaryResponse::rejected(format!(
                        "Resource '{}' on node '{}' has a different uuid",
                        rsc_name, node
                    )));
                }
                None => {
                    return Ok(PrimaryResponse::rejected(format!(
                        "Resource '{}' is not deployed on node '{}'",
                        rsc_name, node
                    )));
                }
            }

            match rsc_dfn.props.get(keys::KEY_DRBD_PRIMARY_SET_ON, None) {
                Some(holder) if holder.eq_ignore_ascii_case(node.display_value()) => None,
                Some(holder) => {
                    debug!(rsc = %rsc_name, node = %node, holder, "Primary already claimed");
                    return Ok(PrimaryResponse::rejected(format!(
                        "Primary of resource '{}' is already set on node '{}'",
                        rsc_name, holder
                    )));
                }
                None => {
                    let mut props = rsc_dfn.props.clone();
                    props.set(keys::KEY_DRBD_PRIMARY_SET_ON, None, node.display_value());

                    let mut tx = self.core.begin_transaction();
                    tx.update_column(&*rsc_dfn, columns::PROPS, serde_json::to_string(&props)?);
                    tx.commit().await?;
                    rsc_dfn.props = props;
                    Some(rsc_dfn.clone())
                }
            }
        };

        if let Some(rsc_dfn) = updated {
            info!(rsc = %rsc_name, node = %node, "Primary role granted");
            match self.updater.update_satellites(&rsc_dfn, all_nodes()).await {
                Ok(stream) => {
                    let rc = combine_responses(
                        stream,
                        &rsc_name,
                        &[node.clone()],
                        "Primary of resource {1} set on {0}",
                        "Notified {0} about the new primary of resource {1}",
                    )
                    .await;
                    if rc.has_errors() {
                        warn!(rsc = %rsc_name, "Not every satellite learned about the new primary");
                    }
                }
                Err(err) => warn!(rsc = %rsc_name, error = %err, "Failed to push primary claim"),
            }
        }

        Ok(PrimaryResponse::Granted {
            skip_initial_sync: request.already_initialized,
        })
    }
}
