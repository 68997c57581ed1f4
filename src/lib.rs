//! Replistor - Replicated Block Storage Orchestrator
//!
//! A controller keeps the replica count of every resource definition at its
//! target while satellites realize resources as stacks of device layers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                                Controller                                    │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │    Reconcile    │  │     Replica     │  │      Autoplacer /           │  │
//! │  │    Scheduler    │──│   Reconciler    │──│      Resource Creator       │  │
//! │  └─────────────────┘  └────────┬────────┘  └─────────────────────────────┘  │
//! │                                │                                             │
//! │                    ┌───────────┴───────────┐   ┌───────────────────────┐    │
//! │                    │     Core Objects      │───│  Persistence (Memory  │    │
//! │                    │   (lock ordered)      │   │   or KV engine)       │    │
//! │                    └───────────┬───────────┘   └───────────────────────┘    │
//! ├────────────────────────────────┼────────────────────────────────────────────┤
//! │                     Satellite updater (per node channel)                     │
//! ├────────────────────────────────┼────────────────────────────────────────────┤
//! │                                ▼                   Satellite                 │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │     Stack       │  │     Device      │  │    DRBD │ LUKS │ Storage    │  │
//! │  │    Expander     │──│   Dispatcher    │──│      device layers          │  │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controller`]: Entity graph, replica reconciliation and satellite sync
//! - [`satellite`]: Layer expansion, device layers and the dispatcher
//! - [`persistence`]: Transactions, database engines and the startup loader
//! - [`domain`]: Entity model, structured results, security and ports
//! - [`config`]: Controller and satellite configuration
//! - [`metrics`]: Reconcile and dispatch counters
//! - [`error`]: Error types and handling

pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod persistence;
pub mod satellite;

// Re-export commonly used types
pub use config::{ControllerConfig, SatelliteConfig, StorPoolConfig};

pub use controller::{
    CapacityAutoplacer, CoreObjects, CtrlResourceCreator, PeerSatelliteUpdater,
    PrimaryRequestHandler, ReconcileScheduler, ReplicaReconciler, TopologyEvent,
};

pub use domain::{
    AccessContext, AccessControl, ApiCallRc, DeviceLayerKind, NodeName, RcEntry, Resource,
    ResourceName, SatelliteMessage,
};

pub use error::{Error, ErrorAction, Result};

pub use metrics::{DispatchMetrics, ReconcileMetrics};

pub use persistence::{create_engine, DatabaseLoader};

pub use satellite::{
    DeviceDispatcher, DrbdLayer, LayerRegistry, LuksLayer, SatelliteService, StackExpander,
    StorageLayer,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
