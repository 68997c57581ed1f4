//! Access control
//!
//! Every read or mutation of a protected object is checked against the
//! caller's [`AccessContext`]. Background components run with the system
//! context; a denial there points at a configuration defect.

use super::api_rc::codes;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Role of the acting identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    Admin,
    User,
    Public,
}

/// Identity and role a call is executed with
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessContext {
    pub identity: String,
    pub role: Role,
}

impl AccessContext {
    pub fn new(identity: impl Into<String>, role: Role) -> Self {
        Self {
            identity: identity.into(),
            role,
        }
    }

    /// Context of the controller's own background work
    pub fn system() -> Self {
        Self::new("SYSTEM", Role::System)
    }

    pub fn public() -> Self {
        Self::new("PUBLIC", Role::Public)
    }
}

/// Access levels, ordered from weakest to strongest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AccessType {
    View,
    Use,
    Change,
    Control,
}

impl std::fmt::Display for AccessType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessType::View => write!(f, "VIEW"),
            AccessType::Use => write!(f, "USE"),
            AccessType::Change => write!(f, "CHANGE"),
            AccessType::Control => write!(f, "CONTROL"),
        }
    }
}

/// Classes of protected objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Node,
    ResourceGroup,
    ResourceDefinition,
    Resource,
    StorPool,
    ControllerConfig,
}

impl ObjectKind {
    fn denied_code(&self) -> u64 {
        match self {
            ObjectKind::Node | ObjectKind::StorPool => codes::FAIL_ACC_DENIED_NODE,
            ObjectKind::Resource => codes::FAIL_ACC_DENIED_RSC,
            ObjectKind::ResourceGroup
            | ObjectKind::ResourceDefinition
            | ObjectKind::ControllerConfig => codes::FAIL_ACC_DENIED_RSC_DFN,
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectKind::Node => write!(f, "node"),
            ObjectKind::ResourceGroup => write!(f, "resource group"),
            ObjectKind::ResourceDefinition => write!(f, "resource definition"),
            ObjectKind::Resource => write!(f, "resource"),
            ObjectKind::StorPool => write!(f, "storage pool"),
            ObjectKind::ControllerConfig => write!(f, "controller configuration"),
        }
    }
}

// =============================================================================
// Access Control Port
// =============================================================================

/// Port deciding whether a context may access an object
pub trait AccessControl: Send + Sync {
    fn has_access(&self, ctx: &AccessContext, kind: ObjectKind, name: &str, access: AccessType) -> bool;

    fn require_access(
        &self,
        ctx: &AccessContext,
        kind: ObjectKind,
        name: &str,
        access: AccessType,
    ) -> Result<()> {
        if self.has_access(ctx, kind, name, access) {
            Ok(())
        } else {
            Err(Error::access_denied(
                format!(
                    "{} is not granted {} access to {} '{}'",
                    ctx.identity, access, kind, name
                ),
                kind.denied_code(),
            ))
        }
    }
}

pub type AccessControlRef = Arc<dyn AccessControl>;

/// Grants everything. Used when no security driver is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissiveAccessControl;

impl AccessControl for PermissiveAccessControl {
    fn has_access(&self, _: &AccessContext, _: ObjectKind, _: &str, _: AccessType) -> bool {
        true
    }
}

/// Upper bound of access an identity has on one class of objects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRule {
    pub identity: String,
    pub kind: ObjectKind,
    /// Restrict the rule to one object; `None` covers the whole class
    pub object_name: Option<String>,
    /// Strongest access granted; `None` denies all access
    pub max_access: Option<AccessType>,
}

/// Rule based access control: access is granted unless a matching rule
/// caps it below the requested level.
#[derive(Debug, Clone, Default)]
pub struct RuleAccessControl {
    rules: Vec<AccessRule>,
}

impl RuleAccessControl {
    pub fn new(rules: Vec<AccessRule>) -> Self {
        Self { rules }
    }

    pub fn add_rule(&mut self, rule: AccessRule) {
        self.rules.push(rule);
    }
}

impl AccessControl for RuleAccessControl {
    fn has_access(&self, ctx: &AccessContext, kind: ObjectKind, name: &str, access: AccessType) -> bool {
        self.rules
            .iter()
            .filter(|rule| rule.identity == ctx.identity && rule.kind == kind)
            .filter(|rule| {
                rule.object_name
                    .as_deref()
                    .map_or(true, |obj| obj.eq_ignore_ascii_case(name))
            })
            .all(|rule| rule.max_access.is_some_and(|max| access <= max))
    }
}
