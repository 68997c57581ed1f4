//! Domain layer - Entity model and port definitions
//!
//! This module defines the shared entity graph, structured results, access
//! control and the traits (ports) that adapters implement, following
//! hexagonal architecture principles.

pub mod api_rc;
pub mod model;
pub mod ports;
pub mod security;
pub mod select_filter;

pub use api_rc::{ApiCallRc, ApiOperation, RcEntry, ResponseContext};
pub use model::*;
pub use ports::*;
pub use security::*;
pub use select_filter::AutoSelectFilter;
