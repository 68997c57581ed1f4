//! Structured API call results
//!
//! Every recoverable failure is reported as an [`RcEntry`] (return code,
//! message, cause, correction, details) collected into an [`ApiCallRc`],
//! never as a raw error propagated to an external caller.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Return Codes
// =============================================================================

/// Return code masks and well-known codes.
///
/// A return code is composed of a severity (top two bits), an object
/// class, an operation and a detail number.
pub mod codes {
    // Severity
    pub const MASK_SEVERITY: u64 = 0xC000_0000_0000_0000;
    pub const MASK_ERROR: u64 = 0xC000_0000_0000_0000;
    pub const MASK_WARN: u64 = 0x8000_0000_0000_0000;
    pub const MASK_INFO: u64 = 0x4000_0000_0000_0000;
    pub const MASK_SUCCESS: u64 = 0x0000_0000_0000_0000;

    // Operation
    pub const MASK_OP: u64 = 0x0000_0000_0C00_0000;
    pub const MASK_CRT: u64 = 0x0000_0000_0400_0000;
    pub const MASK_MOD: u64 = 0x0000_0000_0800_0000;
    pub const MASK_DEL: u64 = 0x0000_0000_0C00_0000;

    // Object
    pub const MASK_OBJ: u64 = 0x0000_0000_03C0_0000;
    pub const MASK_NODE: u64 = 0x0000_0000_03C0_0000;
    pub const MASK_RSC_DFN: u64 = 0x0000_0000_0280_0000;
    pub const MASK_RSC: u64 = 0x0000_0000_0240_0000;
    pub const MASK_VLM_DFN: u64 = 0x0000_0000_0200_0000;
    pub const MASK_STOR_POOL: u64 = 0x0000_0000_0100_0000;
    pub const MASK_SNAPSHOT: u64 = 0x0000_0000_0080_0000;

    // Success codes
    pub const CREATED: u64 = MASK_SUCCESS | 1;
    pub const MODIFIED: u64 = MASK_SUCCESS | 3;
    pub const DELETED: u64 = MASK_SUCCESS | 4;

    // Warnings
    pub const WARN_NOT_CONNECTED: u64 = MASK_WARN | 1;
    pub const WARN_NOT_ENOUGH_NODES: u64 = MASK_WARN | 2;

    // Failures
    pub const FAIL_SQL: u64 = MASK_ERROR | 7;
    pub const FAIL_ACC_DENIED_NODE: u64 = MASK_ERROR | 11;
    pub const FAIL_ACC_DENIED_RSC_DFN: u64 = MASK_ERROR | 12;
    pub const FAIL_ACC_DENIED_RSC: u64 = MASK_ERROR | 13;
    pub const FAIL_NOT_FOUND_NODE: u64 = MASK_ERROR | 100;
    pub const FAIL_NOT_FOUND_RSC_DFN: u64 = MASK_ERROR | 101;
    pub const FAIL_NOT_FOUND_RSC: u64 = MASK_ERROR | 102;
    pub const FAIL_NOT_FOUND_STOR_POOL: u64 = MASK_ERROR | 103;
    pub const FAIL_EXISTS_RSC: u64 = MASK_ERROR | 200;
    pub const FAIL_NOT_ENOUGH_NODES: u64 = MASK_ERROR | 300;
    pub const FAIL_NOT_CONNECTED: u64 = MASK_ERROR | 301;
    pub const FAIL_INVLD_LAYER_STACK: u64 = MASK_ERROR | 400;
    pub const FAIL_LAYER_PREPARE: u64 = MASK_ERROR | 500;
    pub const FAIL_LAYER_CLEANUP: u64 = MASK_ERROR | 501;
    pub const FAIL_STOR_LAYER: u64 = MASK_ERROR | 510;
    pub const FAIL_RSC_LAYER: u64 = MASK_ERROR | 511;
    pub const FAIL_VLM_LAYER: u64 = MASK_ERROR | 512;
    pub const FAIL_UNKNOWN_ERROR: u64 = MASK_ERROR | 0xFFFF;
}

// =============================================================================
// Return Code Entry
// =============================================================================

/// A single structured result entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RcEntry {
    pub return_code: u64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub obj_refs: BTreeMap<String, String>,
}

impl RcEntry {
    pub fn new(return_code: u64, message: impl Into<String>) -> Self {
        Self {
            return_code,
            message: message.into(),
            cause: None,
            correction: None,
            details: None,
            obj_refs: BTreeMap::new(),
        }
    }

    pub fn with_cause(mut self, cause: Option<impl Into<String>>) -> Self {
        self.cause = cause.map(Into::into);
        self
    }

    pub fn with_correction(mut self, correction: Option<impl Into<String>>) -> Self {
        self.correction = correction.map(Into::into);
        self
    }

    pub fn with_details(mut self, details: Option<impl Into<String>>) -> Self {
        self.details = details.map(Into::into);
        self
    }

    pub fn with_obj_ref(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.obj_refs.insert(key.into(), value.into());
        self
    }

    /// Severity bits of the return code
    #[inline]
    pub fn severity(&self) -> u64 {
        self.return_code & codes::MASK_SEVERITY
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.severity() == codes::MASK_ERROR
    }

    #[inline]
    pub fn is_warning(&self) -> bool {
        self.severity() == codes::MASK_WARN
    }
}

impl std::fmt::Display for RcEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (rc={:#018x})", self.message, self.return_code)
    }
}

// =============================================================================
// Api Call Result Collection
// =============================================================================

/// Collection of result entries for one API call or dispatch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiCallRc {
    entries: Vec<RcEntry>,
}

impl ApiCallRc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn singleton(entry: RcEntry) -> Self {
        Self {
            entries: vec![entry],
        }
    }

    pub fn add_entry(&mut self, entry: RcEntry) {
        self.entries.push(entry);
    }

    pub fn add_entries(&mut self, other: ApiCallRc) {
        self.entries.extend(other.entries);
    }

    pub fn entries(&self) -> &[RcEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn has_errors(&self) -> bool {
        self.entries.iter().any(RcEntry::is_error)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RcEntry> {
        self.entries.iter()
    }
}

impl From<RcEntry> for ApiCallRc {
    fn from(entry: RcEntry) -> Self {
        Self::singleton(entry)
    }
}

impl IntoIterator for ApiCallRc {
    type Item = RcEntry;
    type IntoIter = std::vec::IntoIter<RcEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

// =============================================================================
// Response Context
// =============================================================================

/// Operation an API response refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiOperation {
    Create,
    Modify,
    Delete,
}

impl ApiOperation {
    pub fn mask(&self) -> u64 {
        match self {
            ApiOperation::Create => codes::MASK_CRT,
            ApiOperation::Modify => codes::MASK_MOD,
            ApiOperation::Delete => codes::MASK_DEL,
        }
    }
}

/// Describes the object and operation a set of responses belongs to
#[derive(Debug, Clone)]
pub struct ResponseContext {
    pub operation: ApiOperation,
    /// Description used at the start of a sentence
    pub obj_description: String,
    /// Description used inline
    pub obj_description_inline: String,
    /// Object mask combined into generated return codes
    pub obj_mask: u64,
    pub obj_refs: BTreeMap<String, String>,
}

impl ResponseContext {
    pub fn new(
        operation: ApiOperation,
        obj_description: impl Into<String>,
        obj_description_inline: impl Into<String>,
        obj_mask: u64,
    ) -> Self {
        Self {
            operation,
            obj_description: obj_description.into(),
            obj_description_inline: obj_description_inline.into(),
            obj_mask,
            obj_refs: BTreeMap::new(),
        }
    }

    /// Build a success entry tagged with this context's masks
    pub fn success(&self, detail_code: u64, message: impl Into<String>) -> RcEntry {
        let mut entry = RcEntry::new(
            codes::MASK_SUCCESS | self.operation.mask() | self.obj_mask | detail_code,
            message,
        );
        entry.obj_refs = self.obj_refs.clone();
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity() {
        assert!(RcEntry::new(codes::FAIL_UNKNOWN_ERROR, "x").is_error());
        assert!(RcEntry::new(codes::WARN_NOT_CONNECTED, "x").is_warning());
        assert!(!RcEntry::new(codes::CREATED, "x").is_error());
        assert!(!RcEntry::new(codes::FAIL_LAYER_PREPARE, "x").is_warning());
    }

    #[test]
    fn test_api_call_rc_aggregation() {
        let mut rc = ApiCallRc::new();
        assert!(rc.is_empty());

        rc.add_entry(RcEntry::new(codes::MODIFIED, "ok"));
        assert!(!rc.has_errors());

        rc.add_entries(ApiCallRc::singleton(
            RcEntry::new(codes::FAIL_STOR_LAYER, "failed")
                .with_cause(Some("disk gone"))
                .with_correction(None::<String>),
        ));
        assert_eq!(rc.len(), 2);
        assert!(rc.has_errors());
        assert_eq!(rc.entries()[1].cause.as_deref(), Some("disk gone"));
        assert_eq!(rc.entries()[1].correction, None);
    }

    #[test]
    fn test_response_context_success_masks() {
        let ctx = ResponseContext::new(
            ApiOperation::Delete,
            "Auto-evicting resource: r0",
            "auto-evicting resource: r0",
            codes::MASK_RSC,
        );
        let entry = ctx.success(codes::DELETED, "done");
        assert_eq!(entry.return_code & codes::MASK_OP, codes::MASK_DEL);
        assert_eq!(entry.return_code & codes::MASK_OBJ, codes::MASK_RSC);
        assert!(!entry.is_error());
    }
}
