//! Cross-source correlation of unlinked items.
//!
//! # Responsibility
//! - Propose links between unlinked side-A and side-B items that look like
//!   the same real-world entry.
//! - Defer, rather than guess, whenever the choice is ambiguous.
//!
//! # Invariants
//! - Each item appears in at most one proposed link.
//! - Output depends only on the inputs: A items are processed in ascending
//!   `source_local_id` order and every tie-break is explicit.
//! - Only unlinked items are inputs, so existing links are never altered.
//! - Orphans (items with no candidate at all) are the only items the engine
//!   may create on the counterpart. Deferred items are never orphans.

use crate::config::LinkingConfig;
use crate::model::item::SourceItem;
use crate::sync::similarity::{normalize_name, similarity};
use log::{debug, info};
use std::collections::{BTreeMap, BTreeSet};

const SCORE_EPSILON: f64 = 1e-9;
const DUPLICATE_BASE_CONFIDENCE: f64 = 0.9;
const DUPLICATE_CONFIDENCE_STEP: f64 = 0.1;
const DUPLICATE_MIN_CONFIDENCE: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchReason {
    /// Single exact-name candidate on each side.
    ExactUnique,
    /// Exact name shared by several items; assigned by multiplicity.
    ExactDuplicate,
    /// Best candidate above the similarity threshold.
    Fuzzy,
}

impl MatchReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExactUnique => "exact_unique",
            Self::ExactDuplicate => "exact_duplicate",
            Self::Fuzzy => "fuzzy",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProposedLink {
    pub a_item_id: String,
    pub b_item_id: String,
    pub confidence: f64,
    pub reason: MatchReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmbiguityReason {
    /// Duplicate-name group larger than `max_duplicate_group`.
    DuplicateGroupOverCap,
    /// Several candidates share the top similarity score.
    FuzzyTie,
    /// Several A items claim the same candidate with the same score.
    ContestedCandidate,
}

impl AmbiguityReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DuplicateGroupOverCap => "duplicate_group_over_cap",
            Self::FuzzyTie => "fuzzy_tie",
            Self::ContestedCandidate => "contested_candidate",
        }
    }
}

/// A side-A item left unlinked on purpose.
#[derive(Debug, Clone, PartialEq)]
pub struct AmbiguousMatch {
    pub a_item_id: String,
    pub candidate_ids: Vec<String>,
    pub score: f64,
    pub reason: AmbiguityReason,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkOutcome {
    pub links: Vec<ProposedLink>,
    pub ambiguous: Vec<AmbiguousMatch>,
    /// A items with no candidate on B, ascending.
    pub orphans_a: Vec<String>,
    /// B items with no candidate on A, ascending.
    pub orphans_b: Vec<String>,
}

/// Unlinked-item counts and duplicate-name groups, for status output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkingSummary {
    pub unlinked_a: usize,
    pub unlinked_b: usize,
    pub potential_exact_matches: usize,
    pub duplicate_names_a: usize,
    pub duplicate_names_b: usize,
}

pub struct ItemLinker {
    config: LinkingConfig,
}

impl ItemLinker {
    pub fn new(config: LinkingConfig) -> Self {
        Self { config }
    }

    /// Correlates unlinked items of both sides.
    pub fn link(&self, unlinked_a: &[SourceItem], unlinked_b: &[SourceItem]) -> LinkOutcome {
        let mut a_items: Vec<&SourceItem> = unlinked_a.iter().filter(|i| i.is_active()).collect();
        let mut b_items: Vec<&SourceItem> = unlinked_b.iter().filter(|i| i.is_active()).collect();
        a_items.sort_by(|l, r| l.source_local_id.cmp(&r.source_local_id));
        b_items.sort_by(|l, r| l.source_local_id.cmp(&r.source_local_id));

        let mut state = LinkState {
            outcome: LinkOutcome::default(),
            remaining_a: (0..a_items.len()).collect(),
            remaining_b: (0..b_items.len()).collect(),
            deferred_a: BTreeSet::new(),
            deferred_b: BTreeSet::new(),
        };

        self.link_exact(&a_items, &b_items, &mut state);
        if self.config.fuzzy_matching {
            self.link_fuzzy(&a_items, &b_items, &mut state);
        }

        let mut outcome = state.outcome;
        outcome.orphans_a = state
            .remaining_a
            .iter()
            .filter(|idx| !state.deferred_a.contains(*idx))
            .map(|idx| a_items[*idx].source_local_id.clone())
            .collect();
        outcome.orphans_b = state
            .remaining_b
            .iter()
            .filter(|idx| !state.deferred_b.contains(*idx))
            .map(|idx| b_items[*idx].source_local_id.clone())
            .collect();

        info!(
            "event=link_items module=sync status=ok unlinked_a={} unlinked_b={} links={} ambiguous={} orphans_a={} orphans_b={}",
            a_items.len(),
            b_items.len(),
            outcome.links.len(),
            outcome.ambiguous.len(),
            outcome.orphans_a.len(),
            outcome.orphans_b.len()
        );
        outcome
    }

    /// Counts unlinked items and duplicate display names.
    pub fn summary(&self, unlinked_a: &[SourceItem], unlinked_b: &[SourceItem]) -> LinkingSummary {
        let groups_a = group_by_name(unlinked_a.iter().filter(|i| i.is_active()));
        let groups_b = group_by_name(unlinked_b.iter().filter(|i| i.is_active()));
        LinkingSummary {
            unlinked_a: groups_a.values().map(Vec::len).sum(),
            unlinked_b: groups_b.values().map(Vec::len).sum(),
            potential_exact_matches: groups_a.keys().filter(|k| groups_b.contains_key(*k)).count(),
            duplicate_names_a: groups_a.values().filter(|g| g.len() > 1).count(),
            duplicate_names_b: groups_b.values().filter(|g| g.len() > 1).count(),
        }
    }

    fn link_exact(&self, a_items: &[&SourceItem], b_items: &[&SourceItem], state: &mut LinkState) {
        let groups_a = group_by_name(a_items.iter().copied());
        let groups_b = group_by_name(b_items.iter().copied());
        let index_a = index_of(a_items);
        let index_b = index_of(b_items);

        for (name, group_a) in &groups_a {
            let Some(group_b) = groups_b.get(name) else {
                continue;
            };
            let idx_a: Vec<usize> = group_a.iter().map(|i| index_a[i.source_local_id.as_str()]).collect();
            let idx_b: Vec<usize> = group_b.iter().map(|i| index_b[i.source_local_id.as_str()]).collect();

            if idx_a.len() == 1 && idx_b.len() == 1 {
                state.accept(idx_a[0], idx_b[0], a_items, b_items, 1.0, MatchReason::ExactUnique);
                continue;
            }

            let cap = self.config.max_duplicate_group;
            if idx_a.len() > cap || idx_b.len() > cap {
                let candidate_ids: Vec<String> =
                    group_b.iter().map(|i| i.source_local_id.clone()).collect();
                for idx in &idx_a {
                    state.defer(AmbiguousMatch {
                        a_item_id: a_items[*idx].source_local_id.clone(),
                        candidate_ids: candidate_ids.clone(),
                        score: 1.0,
                        reason: AmbiguityReason::DuplicateGroupOverCap,
                    });
                    state.deferred_a.insert(*idx);
                }
                state.deferred_b.extend(idx_b.iter().copied());
                continue;
            }

            // Multiplicity assignment: A ascending by id; each takes the most
            // recently modified B still free.
            let mut free_b = idx_b.clone();
            for (position, a_idx) in idx_a.iter().enumerate() {
                let best = free_b
                    .iter()
                    .enumerate()
                    .max_by(|(_, l), (_, r)| {
                        let (l, r) = (b_items[**l], b_items[**r]);
                        l.effective_modified_at()
                            .cmp(&r.effective_modified_at())
                            .then_with(|| r.source_local_id.cmp(&l.source_local_id))
                    })
                    .map(|(slot, idx)| (slot, *idx));
                let Some((slot, b_idx)) = best else {
                    break;
                };
                free_b.remove(slot);
                let confidence = (DUPLICATE_BASE_CONFIDENCE
                    - DUPLICATE_CONFIDENCE_STEP * position as f64)
                    .max(DUPLICATE_MIN_CONFIDENCE);
                state.accept(*a_idx, b_idx, a_items, b_items, confidence, MatchReason::ExactDuplicate);
            }
        }
    }

    fn link_fuzzy(&self, a_items: &[&SourceItem], b_items: &[&SourceItem], state: &mut LinkState) {
        let threshold = self.config.fuzzy_threshold;
        let names_a: Vec<String> = a_items.iter().map(|i| normalize_name(&i.display_name)).collect();
        let names_b: Vec<String> = b_items.iter().map(|i| normalize_name(&i.display_name)).collect();

        let candidates_of = |a_idx: usize, state: &LinkState| -> Vec<(usize, f64)> {
            state
                .remaining_b
                .iter()
                .filter(|b_idx| !state.deferred_b.contains(*b_idx))
                .map(|b_idx| (*b_idx, similarity(&names_a[a_idx], &names_b[*b_idx])))
                .filter(|(_, score)| *score >= threshold)
                .collect()
        };

        // Rounds: every A claims its unique best candidate; a B claimed by
        // one A at the top score is linked. Repeat while links are made so
        // losers can fall back to their next candidate.
        loop {
            let mut claims: BTreeMap<usize, Vec<(usize, f64)>> = BTreeMap::new();
            for a_idx in state.remaining_a.iter().filter(|i| !state.deferred_a.contains(*i)) {
                let candidates = candidates_of(*a_idx, state);
                if let Some((b_idx, score)) = unique_top(&candidates) {
                    claims.entry(b_idx).or_default().push((*a_idx, score));
                }
            }

            let mut linked_any = false;
            for (b_idx, claimants) in claims {
                if let Some((a_idx, score)) = unique_top(&claimants) {
                    state.accept(a_idx, b_idx, a_items, b_items, score, MatchReason::Fuzzy);
                    linked_any = true;
                }
            }
            if !linked_any {
                break;
            }
        }

        // Whatever still has candidates is stuck on a tie.
        let stuck: Vec<usize> = state
            .remaining_a
            .iter()
            .filter(|i| !state.deferred_a.contains(*i))
            .copied()
            .collect();
        let mut contested_b = BTreeSet::new();
        for a_idx in stuck {
            let candidates = candidates_of(a_idx, state);
            if candidates.is_empty() {
                continue;
            }
            let top = candidates
                .iter()
                .map(|(_, score)| *score)
                .fold(f64::MIN, f64::max);
            let reason = if unique_top(&candidates).is_some() {
                AmbiguityReason::ContestedCandidate
            } else {
                AmbiguityReason::FuzzyTie
            };
            let mut candidate_ids: Vec<String> = candidates
                .iter()
                .filter(|(_, score)| (score - top).abs() < SCORE_EPSILON)
                .map(|(b_idx, _)| b_items[*b_idx].source_local_id.clone())
                .collect();
            candidate_ids.sort();
            contested_b.extend(candidates.iter().map(|(b_idx, _)| *b_idx));
            state.deferred_a.insert(a_idx);
            state.defer(AmbiguousMatch {
                a_item_id: a_items[a_idx].source_local_id.clone(),
                candidate_ids,
                score: top,
                reason,
            });
        }
        state.deferred_b.extend(contested_b);
    }
}

struct LinkState {
    outcome: LinkOutcome,
    remaining_a: BTreeSet<usize>,
    remaining_b: BTreeSet<usize>,
    deferred_a: BTreeSet<usize>,
    deferred_b: BTreeSet<usize>,
}

impl LinkState {
    fn accept(
        &mut self,
        a_idx: usize,
        b_idx: usize,
        a_items: &[&SourceItem],
        b_items: &[&SourceItem],
        confidence: f64,
        reason: MatchReason,
    ) {
        self.remaining_a.remove(&a_idx);
        self.remaining_b.remove(&b_idx);
        let (a, b) = (a_items[a_idx], b_items[b_idx]);
        debug!(
            "event=link_proposed module=sync status=ok a_item_id={} b_item_id={} confidence={:.2} reason={}",
            a.source_local_id,
            b.source_local_id,
            confidence,
            reason.as_str()
        );
        self.outcome.links.push(ProposedLink {
            a_item_id: a.source_local_id.clone(),
            b_item_id: b.source_local_id.clone(),
            confidence,
            reason,
        });
    }

    fn defer(&mut self, ambiguous: AmbiguousMatch) {
        debug!(
            "event=link_deferred module=sync status=skip a_item_id={} candidates={} reason={}",
            ambiguous.a_item_id,
            ambiguous.candidate_ids.len(),
            ambiguous.reason.as_str()
        );
        self.outcome.ambiguous.push(ambiguous);
    }
}

/// Returns the single entry with the highest score, or `None` when empty or
/// when the top score is shared.
fn unique_top(scored: &[(usize, f64)]) -> Option<(usize, f64)> {
    let top = scored.iter().map(|(_, s)| *s).fold(f64::MIN, f64::max);
    let mut best = scored.iter().filter(|(_, s)| (s - top).abs() < SCORE_EPSILON);
    let first = best.next()?;
    if best.next().is_some() {
        return None;
    }
    Some(*first)
}

fn group_by_name<'a>(
    items: impl Iterator<Item = &'a SourceItem>,
) -> BTreeMap<String, Vec<&'a SourceItem>> {
    let mut groups: BTreeMap<String, Vec<&SourceItem>> = BTreeMap::new();
    for item in items {
        groups
            .entry(normalize_name(&item.display_name))
            .or_default()
            .push(item);
    }
    groups
}

fn index_of<'a>(items: &[&'a SourceItem]) -> BTreeMap<&'a str, usize> {
    items
        .iter()
        .enumerate()
        .map(|(idx, item)| (item.source_local_id.as_str(), idx))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{AmbiguityReason, ItemLinker, MatchReason};
    use crate::config::LinkingConfig;
    use crate::model::item::{RemoteItem, Side, SourceItem};

    fn item(side: Side, id: &str, name: &str, modified: i64) -> SourceItem {
        SourceItem::observed(side, "list", &RemoteItem::new(id, name, false), modified)
    }

    fn linker() -> ItemLinker {
        ItemLinker::new(LinkingConfig::default())
    }

    #[test]
    fn unique_exact_match_links_with_full_confidence() {
        let a = vec![item(Side::A, "a1", "Milk", 1)];
        let b = vec![item(Side::B, "b1", "  MILK ", 1)];

        let outcome = linker().link(&a, &b);

        assert_eq!(outcome.links.len(), 1);
        assert_eq!(outcome.links[0].b_item_id, "b1");
        assert!((outcome.links[0].confidence - 1.0).abs() < f64::EPSILON);
        assert_eq!(outcome.links[0].reason, MatchReason::ExactUnique);
        assert!(outcome.orphans_a.is_empty() && outcome.orphans_b.is_empty());
    }

    #[test]
    fn duplicate_names_link_one_to_one_preferring_recent_b() {
        let a = vec![
            item(Side::A, "a2", "Milk", 1),
            item(Side::A, "a1", "Milk", 1),
            item(Side::A, "a3", "Milk", 1),
        ];
        let b = vec![
            item(Side::B, "b1", "Milk", 10),
            item(Side::B, "b2", "Milk", 30),
            item(Side::B, "b3", "Milk", 20),
        ];

        let outcome = linker().link(&a, &b);

        let pairs: Vec<(&str, &str)> = outcome
            .links
            .iter()
            .map(|l| (l.a_item_id.as_str(), l.b_item_id.as_str()))
            .collect();
        assert_eq!(pairs, vec![("a1", "b2"), ("a2", "b3"), ("a3", "b1")]);
        assert!(outcome
            .links
            .iter()
            .all(|l| l.reason == MatchReason::ExactDuplicate));
        assert!((outcome.links[0].confidence - 0.9).abs() < 1e-9);
        assert!((outcome.links[2].confidence - 0.7).abs() < 1e-9);
        assert!(outcome.ambiguous.is_empty());
    }

    #[test]
    fn surplus_duplicates_become_orphans() {
        let a = vec![
            item(Side::A, "a1", "Eggs", 1),
            item(Side::A, "a2", "Eggs", 1),
            item(Side::A, "a3", "Eggs", 1),
        ];
        let b = vec![item(Side::B, "b1", "Eggs", 1), item(Side::B, "b2", "Eggs", 1)];

        let outcome = linker().link(&a, &b);

        assert_eq!(outcome.links.len(), 2);
        assert_eq!(outcome.orphans_a, vec!["a3".to_string()]);
        assert!(outcome.orphans_b.is_empty());
    }

    #[test]
    fn duplicate_group_over_cap_is_deferred() {
        let config = LinkingConfig {
            max_duplicate_group: 2,
            ..LinkingConfig::default()
        };
        let a: Vec<_> = (1..=3).map(|n| item(Side::A, &format!("a{n}"), "Bananas", 1)).collect();
        let b: Vec<_> = (1..=3).map(|n| item(Side::B, &format!("b{n}"), "Bananas", 1)).collect();

        let outcome = ItemLinker::new(config).link(&a, &b);

        assert!(outcome.links.is_empty());
        assert_eq!(outcome.ambiguous.len(), 3);
        assert!(outcome
            .ambiguous
            .iter()
            .all(|m| m.reason == AmbiguityReason::DuplicateGroupOverCap));
        assert!(outcome.orphans_a.is_empty());
        assert!(outcome.orphans_b.is_empty());
    }

    #[test]
    fn fuzzy_match_links_best_candidate_above_threshold() {
        let a = vec![item(Side::A, "a1", "Tomatoes", 1)];
        let b = vec![
            item(Side::B, "b1", "Tomatos", 1),
            item(Side::B, "b2", "Potatoes", 1),
            item(Side::B, "b3", "Bread", 1),
        ];

        let outcome = linker().link(&a, &b);

        assert_eq!(outcome.links.len(), 1);
        assert_eq!(outcome.links[0].b_item_id, "b1");
        assert_eq!(outcome.links[0].reason, MatchReason::Fuzzy);
        assert!(outcome.links[0].confidence < 1.0);
        assert_eq!(outcome.orphans_b, vec!["b2".to_string(), "b3".to_string()]);
    }

    #[test]
    fn fuzzy_tie_defers_and_creates_nothing() {
        let a = vec![item(Side::A, "a1", "Apple", 1)];
        let b = vec![item(Side::B, "b1", "Apples", 1), item(Side::B, "b2", "Applex", 1)];

        let outcome = linker().link(&a, &b);

        assert!(outcome.links.is_empty());
        assert_eq!(outcome.ambiguous.len(), 1);
        assert_eq!(outcome.ambiguous[0].reason, AmbiguityReason::FuzzyTie);
        assert_eq!(outcome.ambiguous[0].candidate_ids, vec!["b1", "b2"]);
        assert!(outcome.orphans_a.is_empty());
        assert!(outcome.orphans_b.is_empty());
    }

    #[test]
    fn contested_candidate_loser_falls_back_to_next_best() {
        // a1 and a2 both prefer b1; a1 scores higher and wins, a2 then takes b2.
        let a = vec![
            item(Side::A, "a1", "Whole milk.", 1),
            item(Side::A, "a2", "Wholemilk", 1),
        ];
        let b = vec![
            item(Side::B, "b1", "Whole milk", 1),
            item(Side::B, "b2", "Whole-milks", 1),
        ];

        let outcome = linker().link(&a, &b);

        let pairs: Vec<(&str, &str)> = outcome
            .links
            .iter()
            .map(|l| (l.a_item_id.as_str(), l.b_item_id.as_str()))
            .collect();
        assert_eq!(pairs, vec![("a1", "b1"), ("a2", "b2")]);
        assert!(outcome.ambiguous.is_empty());
        assert!(outcome.orphans_a.is_empty());
    }

    #[test]
    fn no_candidate_yields_orphans_on_both_sides() {
        let a = vec![item(Side::A, "a1", "Milk", 1)];
        let b = vec![item(Side::B, "b1", "Charcoal", 1)];

        let outcome = linker().link(&a, &b);

        assert!(outcome.links.is_empty());
        assert_eq!(outcome.orphans_a, vec!["a1".to_string()]);
        assert_eq!(outcome.orphans_b, vec!["b1".to_string()]);
    }

    #[test]
    fn fuzzy_disabled_only_links_exact_names() {
        let config = LinkingConfig {
            fuzzy_matching: false,
            ..LinkingConfig::default()
        };
        let a = vec![item(Side::A, "a1", "Tomatoes", 1)];
        let b = vec![item(Side::B, "b1", "Tomatos", 1)];

        let outcome = ItemLinker::new(config).link(&a, &b);

        assert!(outcome.links.is_empty());
        assert_eq!(outcome.orphans_a.len(), 1);
    }

    #[test]
    fn linking_is_deterministic() {
        let a = vec![item(Side::A, "a1", "Milk", 1), item(Side::A, "a2", "Milk", 1)];
        let b = vec![item(Side::B, "b1", "Milk", 5), item(Side::B, "b2", "Milk", 5)];

        let first = linker().link(&a, &b);
        let second = linker().link(&a, &b);

        assert_eq!(first, second);
        // Equal recency: lower B id first.
        assert_eq!(first.links[0].b_item_id, "b1");
    }

    #[test]
    fn summary_counts_duplicate_groups() {
        let a = vec![item(Side::A, "a1", "Milk", 1), item(Side::A, "a2", "milk", 1)];
        let b = vec![item(Side::B, "b1", "Milk", 1), item(Side::B, "b2", "Eggs", 1)];

        let summary = linker().summary(&a, &b);

        assert_eq!(summary.unlinked_a, 2);
        assert_eq!(summary.unlinked_b, 2);
        assert_eq!(summary.potential_exact_matches, 1);
        assert_eq!(summary.duplicate_names_a, 1);
        assert_eq!(summary.duplicate_names_b, 0);
    }
}
