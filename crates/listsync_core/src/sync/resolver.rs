//! Winner selection for linked pairs whose states diverge.
//!
//! # Responsibility
//! - Pick which side of a link carries the authoritative state.
//! - Describe the mutation that brings the other side in line.
//!
//! # Invariants
//! - Pure: no store access, no remote calls, no clock reads.
//! - Identical inputs always produce identical output.
//! - The patch only carries fields that actually differ.
//! - Under recency, a pair where exactly one side changed since the last
//!   cycle resolves toward that side, whatever the timestamps say.

use crate::config::{ConflictConfig, ConflictStrategy};
use crate::model::audit::{AuditKind, AuditPayload, AuditRecord};
use crate::model::item::{ItemPatch, ItemState, Side, SourceItem};
use crate::model::link::Link;

/// How a divergence came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionClass {
    /// Only one side moved; its state is propagated.
    Updated,
    /// Both sides moved, or the pair was linked this cycle.
    ConflictResolved,
}

impl ResolutionClass {
    pub fn audit_kind(self) -> AuditKind {
        match self {
            Self::Updated => AuditKind::Updated,
            Self::ConflictResolved => AuditKind::ConflictResolved,
        }
    }
}

/// Per-pair facts the resolver cannot derive from the snapshots alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DivergenceContext {
    pub a_changed: bool,
    pub b_changed: bool,
    pub new_link: bool,
}

/// Directed mutation: apply `patch` to the `loser` side's item.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub link_id: String,
    pub winner: Side,
    pub loser: Side,
    pub winner_item_id: String,
    pub loser_item_id: String,
    pub patch: ItemPatch,
    pub class: ResolutionClass,
    /// Both sides before the mutation.
    pub before_a: ItemState,
    pub before_b: ItemState,
}

impl Resolution {
    /// Loser state once the patch has landed.
    pub fn resulting_state(&self) -> ItemState {
        let loser_before = match self.loser {
            Side::A => &self.before_a,
            Side::B => &self.before_b,
        };
        self.patch.apply_to(loser_before)
    }

    pub fn audit_record(&self, cycle_id: &str, created_at: i64) -> AuditRecord {
        AuditRecord::new(cycle_id, self.class.audit_kind(), created_at)
            .for_item(self.loser, self.loser_item_id.as_str())
            .with_counterpart(self.winner_item_id.as_str())
            .with_link(self.link_id.as_str())
            .with_before(AuditPayload::Pair {
                a: self.before_a.clone(),
                b: self.before_b.clone(),
            })
            .with_after(AuditPayload::Item(self.resulting_state()))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConflictResolver {
    config: ConflictConfig,
}

impl ConflictResolver {
    pub fn new(config: ConflictConfig) -> Self {
        Self { config }
    }

    /// Returns `None` when both sides already agree.
    pub fn resolve(
        &self,
        link: &Link,
        a: &SourceItem,
        b: &SourceItem,
        context: DivergenceContext,
    ) -> Option<Resolution> {
        let patch_for_b = diff_patch(a, b);
        if patch_for_b.is_empty() {
            return None;
        }

        let winner = self.pick_winner(a, b, context);
        let (winner_item, loser_item) = match winner {
            Side::A => (a, b),
            Side::B => (b, a),
        };
        let patch = match winner {
            Side::A => patch_for_b,
            Side::B => diff_patch(b, a),
        };
        let class = if context.new_link || (context.a_changed && context.b_changed) {
            ResolutionClass::ConflictResolved
        } else {
            ResolutionClass::Updated
        };

        Some(Resolution {
            link_id: link.link_id.clone(),
            winner,
            loser: winner.other(),
            winner_item_id: winner_item.source_local_id.clone(),
            loser_item_id: loser_item.source_local_id.clone(),
            patch,
            class,
            before_a: a.state(),
            before_b: b.state(),
        })
    }

    fn pick_winner(&self, a: &SourceItem, b: &SourceItem, context: DivergenceContext) -> Side {
        let authority = self.config.authority;
        match self.config.strategy {
            ConflictStrategy::Authority => authority,
            ConflictStrategy::Recency => {
                if !context.new_link && context.a_changed != context.b_changed {
                    return if context.a_changed { Side::A } else { Side::B };
                }
                self.later_side(a, b).unwrap_or(authority)
            }
        }
    }

    /// Side modified later by more than the tolerance, if any.
    fn later_side(&self, a: &SourceItem, b: &SourceItem) -> Option<Side> {
        let a_at = a.effective_modified_at();
        let b_at = b.effective_modified_at();
        if a_at.abs_diff(b_at) <= self.config.tolerance_ms {
            return None;
        }
        Some(if a_at > b_at { Side::A } else { Side::B })
    }
}

/// Fields of `target` that differ from `source`, valued from `source`.
fn diff_patch(source: &SourceItem, target: &SourceItem) -> ItemPatch {
    ItemPatch {
        display_name: (source.display_name != target.display_name)
            .then(|| source.display_name.clone()),
        checked: (source.checked != target.checked).then_some(source.checked),
    }
}
