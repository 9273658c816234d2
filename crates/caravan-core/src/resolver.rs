//! # Conflict Resolver
//!
//! Pure decision function reconciling a local change against a remote change
//! using a fixed precedence ruleset. No I/O, deterministic given identical
//! inputs - required for testability and auditability.
//!
//! ## Rule Evaluation Order (first matching rule wins)
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Conflict Precedence Rules                           │
//! │                                                                         │
//! │  1. PROTECTED-FIELD                                                     │
//! │     Kind flagged integrity-protected (assessment/progress data):       │
//! │     the remote side must carry a checksum that validates against its   │
//! │     value before ANY automatic override. Missing or mismatched         │
//! │     checksum → ManualRequired. A valid checksum falls through to the   │
//! │     remaining rules.                                                   │
//! │                                                                         │
//! │  2. ROLE-PRECEDENCE                                                    │
//! │     Both sides carry roles with configured ranks: the higher-ranked    │
//! │     (authoritative) role wins outright, REGARDLESS of timestamp.       │
//! │                                                                         │
//! │  3. CONTENT-SENSITIVITY                                                │
//! │     Kind flagged for manual review: never auto-resolved →              │
//! │     ManualRequired.                                                    │
//! │                                                                         │
//! │  4. RECENCY (fallback)                                                 │
//! │     Later validated timestamp wins. Exact ties resolve to the remote   │
//! │     side so independent replicas converge.                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The ordering of rules 1 and 2 is a documented assumption (see DESIGN.md):
//! protected-field is evaluated first.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::integrity::verify_checksum;
use crate::types::{Conflict, ConflictAudit, ConflictRule, Resolution};

// =============================================================================
// Rule Configuration
// =============================================================================

/// Deployment-supplied ruleset consumed by the resolver.
///
/// BTree collections keep iteration deterministic, which keeps the resolver
/// deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverRules {
    /// Kinds whose remote side must prove integrity before auto-override.
    #[serde(default)]
    pub protected_kinds: BTreeSet<String>,

    /// Kinds that always require manual review.
    #[serde(default)]
    pub sensitive_kinds: BTreeSet<String>,

    /// Role → rank. Higher rank is more authoritative.
    #[serde(default)]
    pub role_ranks: BTreeMap<String, u8>,
}

impl ResolverRules {
    /// True when the kind is integrity-protected.
    pub fn is_protected(&self, kind: &str) -> bool {
        self.protected_kinds.contains(kind)
    }

    /// True when the kind requires manual review.
    pub fn is_sensitive(&self, kind: &str) -> bool {
        self.sensitive_kinds.contains(kind)
    }

    /// Configured rank for a role, if any.
    pub fn rank(&self, role: Option<&str>) -> Option<u8> {
        role.and_then(|r| self.role_ranks.get(r).copied())
    }
}

// =============================================================================
// Decision
// =============================================================================

/// Outcome of one resolver invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionDecision {
    /// How the conflict resolves.
    pub resolution: Resolution,

    /// Which precedence rule fired.
    pub rule: ConflictRule,

    /// Winning value; `None` for `ManualRequired`.
    pub resolved_value: Option<String>,
}

// =============================================================================
// Resolver
// =============================================================================

/// The pure conflict decision function.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    rules: ResolverRules,
}

impl ConflictResolver {
    /// Creates a resolver with the given ruleset.
    pub fn new(rules: ResolverRules) -> Self {
        ConflictResolver { rules }
    }

    /// Read access to the ruleset (for status/diagnostics).
    pub fn rules(&self) -> &ResolverRules {
        &self.rules
    }

    /// Adjudicates a conflict. Identical inputs always yield identical
    /// decisions; the caller records the returned decision as an audit row.
    pub fn resolve(&self, conflict: &Conflict) -> ResolutionDecision {
        // Rule 1: protected-field. A protected kind demands remote proof of
        // integrity before anything is overridden automatically.
        if self.rules.is_protected(&conflict.kind) {
            let remote_validated = conflict
                .remote
                .checksum
                .as_deref()
                .map(|sum| verify_checksum(conflict.remote.value.as_bytes(), sum))
                .unwrap_or(false);

            if !remote_validated {
                return ResolutionDecision {
                    resolution: Resolution::ManualRequired,
                    rule: ConflictRule::ProtectedField,
                    resolved_value: None,
                };
            }
            // Checksum holds: automatic override allowed, continue.
        }

        // Rule 2: role precedence. Authoritative roles win outright.
        if let (Some(local_rank), Some(remote_rank)) = (
            self.rules.rank(conflict.local.role.as_deref()),
            self.rules.rank(conflict.remote.role.as_deref()),
        ) {
            if local_rank != remote_rank {
                let keep_local = local_rank > remote_rank;
                return ResolutionDecision {
                    resolution: if keep_local {
                        Resolution::KeepLocal
                    } else {
                        Resolution::KeepRemote
                    },
                    rule: ConflictRule::RolePrecedence,
                    resolved_value: Some(if keep_local {
                        conflict.local.value.clone()
                    } else {
                        conflict.remote.value.clone()
                    }),
                };
            }
        }

        // Rule 3: content sensitivity. Flagged kinds are never auto-resolved.
        if self.rules.is_sensitive(&conflict.kind) {
            return ResolutionDecision {
                resolution: Resolution::ManualRequired,
                rule: ConflictRule::ContentSensitivity,
                resolved_value: None,
            };
        }

        // Rule 4: recency. Ties go to the remote side.
        let keep_local = conflict.local.changed_at > conflict.remote.changed_at;
        ResolutionDecision {
            resolution: if keep_local {
                Resolution::KeepLocal
            } else {
                Resolution::KeepRemote
            },
            rule: ConflictRule::Recency,
            resolved_value: Some(if keep_local {
                conflict.local.value.clone()
            } else {
                conflict.remote.value.clone()
            }),
        }
    }
}

// =============================================================================
// Audit Construction
// =============================================================================

impl ConflictAudit {
    /// Builds the immutable audit record for one resolver invocation.
    /// The id and timestamp are inputs so the resolver itself stays pure.
    pub fn record(
        conflict: &Conflict,
        decision: &ResolutionDecision,
        audit_id: impl Into<String>,
        audited_at: DateTime<Utc>,
    ) -> Self {
        ConflictAudit {
            id: audit_id.into(),
            operation_id: conflict.operation_id.clone(),
            entity_key: conflict.entity_key.clone(),
            rule: decision.rule,
            resolution: decision.resolution,
            local_value: conflict.local.value.clone(),
            remote_value: conflict.remote.value.clone(),
            resolved_value: decision.resolved_value.clone(),
            audited_at,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
