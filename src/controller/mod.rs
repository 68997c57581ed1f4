//! Controller
//!
//! Owns the cluster's entity graph, keeps replica counts at their target
//! and pushes state changes to the satellites.

pub mod auto_helper;
pub mod auto_replace;
pub mod autoplacer;
pub mod core_objects;
pub mod primary;
pub mod resource_creator;
pub mod satellite_sync;

pub use auto_helper::{
    AutoHelper, AutoHelperContext, AutoHelperRef, CycleReport, ManageOutcome, ReconcileScheduler,
    TopologyEvent,
};
pub use auto_replace::{count_replicas, min_replica_count, ReplicaCounts, ReplicaReconciler};
pub use autoplacer::{CapacityAutoplacer, PlacementCandidate, PlacementEngine};
pub use core_objects::{CoreObjects, LockObj};
pub use primary::{PrimaryRequest, PrimaryRequestHandler, PrimaryResponse};
pub use resource_creator::CtrlResourceCreator;
pub use satellite_sync::{combine_responses, PeerSatelliteUpdater};
