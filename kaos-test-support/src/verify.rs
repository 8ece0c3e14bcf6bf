//! Ranking verification utilities for testing correctness.

use kaos_rank::{LeaderboardEntry, LiveEntry, PointMode};
use std::collections::{HashMap, HashSet};

/// Reference ranking: replays score events with the same rules the live
/// stores apply, without any of their data structures.
#[derive(Debug, Clone)]
pub struct RankModel {
    mode: PointMode,
    next_tie_breaker: i64,
    users: HashMap<String, (i64, i64)>,
}

impl RankModel {
    pub fn new(mode: PointMode) -> Self {
        Self {
            mode,
            next_tie_breaker: 1,
            users: HashMap::new(),
        }
    }

    /// Apply one score event.
    pub fn apply(&mut self, user_id: &str, value: i64) {
        let current = self.users.get(user_id).copied();
        let points = self.mode.combine(current.map(|(p, _)| p), value);
        match current {
            Some((old, _)) if old == points => {}
            _ => {
                self.users
                    .insert(user_id.to_string(), (points, self.next_tie_breaker));
                self.next_tie_breaker += 1;
            }
        }
    }

    pub fn apply_all<'a>(&mut self, events: impl IntoIterator<Item = (&'a str, i64)>) {
        for (user, value) in events {
            self.apply(user, value);
        }
    }

    /// Users best first, with their points.
    pub fn ranking(&self) -> Vec<(String, i64)> {
        let mut rows: Vec<_> = self
            .users
            .iter()
            .map(|(user, (points, tb))| LiveEntry::new(user.clone(), *points, *tb))
            .collect();
        rows.sort_by_key(LiveEntry::key);
        rows.into_iter().map(|e| (e.user_id, e.points)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// Rank at `position` (0-based) is not `position + 1`.
    RankGap { position: usize, rank: Option<u64> },
    /// Row at `position` does not sort strictly after the previous one.
    OutOfOrder { position: usize },
    DuplicateUser { user_id: String },
    /// Ranking differs from the reference model.
    Mismatch {
        position: usize,
        expected: Option<(String, i64)>,
        actual: Option<(String, i64)>,
    },
}

/// Checks structural invariants of rankings and compares them to a model.
#[derive(Debug, Default)]
pub struct RankVerifier {
    violations: Vec<Violation>,
    checked: usize,
}

impl RankVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify durable rows are listed best first with ranks `1..=n`.
    pub fn check_rows(&mut self, rows: &[LeaderboardEntry]) -> &mut Self {
        self.checked += rows.len();
        let mut seen = HashSet::new();
        for (position, row) in rows.iter().enumerate() {
            if row.rank != Some(position as u64 + 1) {
                self.violations.push(Violation::RankGap {
                    position,
                    rank: row.rank,
                });
            }
            if position > 0 && rows[position - 1].key() >= row.key() {
                self.violations.push(Violation::OutOfOrder { position });
            }
            if !seen.insert(row.user_id.as_str()) {
                self.violations.push(Violation::DuplicateUser {
                    user_id: row.user_id.clone(),
                });
            }
        }
        self
    }

    /// Verify live entries are strictly ordered and unique.
    pub fn check_live(&mut self, entries: &[LiveEntry]) -> &mut Self {
        self.checked += entries.len();
        let mut seen = HashSet::new();
        for (position, entry) in entries.iter().enumerate() {
            if position > 0 && entries[position - 1].key() >= entry.key() {
                self.violations.push(Violation::OutOfOrder { position });
            }
            if !seen.insert(entry.user_id.as_str()) {
                self.violations.push(Violation::DuplicateUser {
                    user_id: entry.user_id.clone(),
                });
            }
        }
        self
    }

    /// Compare `(user, points)` order against the model.
    pub fn check_against(&mut self, model: &RankModel, actual: &[(String, i64)]) -> &mut Self {
        let expected = model.ranking();
        for position in 0..expected.len().max(actual.len()) {
            let want = expected.get(position).cloned();
            let got = actual.get(position).cloned();
            if want != got {
                self.violations.push(Violation::Mismatch {
                    position,
                    expected: want,
                    actual: got,
                });
            }
        }
        self
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    pub fn checked(&self) -> usize {
        self.checked
    }

    pub fn has_errors(&self) -> bool {
        !self.violations.is_empty()
    }

    /// Panic with every violation listed.
    pub fn assert_ok(&self) {
        assert!(
            self.violations.is_empty(),
            "ranking violations: {:#?}",
            self.violations
        );
    }
}

/// `(user, points)` pairs from live entries.
pub fn live_pairs(entries: &[LiveEntry]) -> Vec<(String, i64)> {
    entries
        .iter()
        .map(|e| (e.user_id.clone(), e.points))
        .collect()
}

/// `(user, points)` pairs from durable rows.
pub fn row_pairs(rows: &[LeaderboardEntry]) -> Vec<(String, i64)> {
    rows.iter().map(|r| (r.user_id.clone(), r.points)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_cumulative() {
        let mut model = RankModel::new(PointMode::Cumulative);
        model.apply_all([("A", 10), ("B", 8), ("A", 5), ("B", 6)]);
        assert_eq!(
            model.ranking(),
            vec![("A".to_string(), 15), ("B".to_string(), 14)]
        );
    }

    #[test]
    fn test_model_highest_ignores_lower() {
        let mut model = RankModel::new(PointMode::Highest);
        model.apply_all([("B", 9), ("A", 10), ("A", 3), ("B", 9)]);
        assert_eq!(
            model.ranking(),
            vec![("A".to_string(), 10), ("B".to_string(), 9)]
        );
    }

    #[test]
    fn test_model_tie_goes_to_first() {
        let mut model = RankModel::new(PointMode::Cumulative);
        model.apply_all([("late", 1), ("early", 5), ("late", 4)]);
        assert_eq!(model.ranking()[0].0, "early");
    }

    #[test]
    fn test_detects_gaps_and_order() {
        let mut rows = vec![
            LeaderboardEntry::committed("lb", &LiveEntry::new("a", 10, 1), 1),
            LeaderboardEntry::committed("lb", &LiveEntry::new("b", 20, 2), 3),
        ];
        let mut verifier = RankVerifier::new();
        verifier.check_rows(&rows);
        assert_eq!(verifier.violations().len(), 2);

        rows.swap(0, 1);
        rows[0].rank = Some(1);
        rows[1].rank = Some(2);
        let mut verifier = RankVerifier::new();
        verifier.check_rows(&rows).assert_ok();
    }

    #[test]
    fn test_mismatch_against_model() {
        let mut model = RankModel::new(PointMode::Highest);
        model.apply("a", 5);
        let mut verifier = RankVerifier::new();
        verifier.check_against(&model, &[("a".to_string(), 4)]);
        assert!(verifier.has_errors());
    }
}
