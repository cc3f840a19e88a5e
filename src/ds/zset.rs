//! Per-bucket sorted-set state (§4.4): a score-ordered collection keyed by
//! member, tied-broken by member-key lexicographic order.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

/// Wraps `f64` with a total order (scores are assumed finite, never NaN, as
/// the store never itself produces a NaN score and the API takes `f64`
/// directly rather than re-validating every call).
#[derive(Debug, Clone, Copy, PartialEq)]
struct Score(f64);

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(Ordering::Equal)
    }
}

/// Score-range filter shared by `ZRangeByScore` and `ZCount`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreRangeOpts {
    pub limit: i64,
    pub exclude_start: bool,
    pub exclude_end: bool,
}

#[derive(Default, Clone)]
pub struct ZSetState {
    by_member: HashMap<Vec<u8>, (f64, Vec<u8>)>,
    ordered: BTreeSet<(Score, Vec<u8>)>,
}

impl ZSetState {
    pub fn new() -> Self {
        Self {
            by_member: HashMap::new(),
            ordered: BTreeSet::new(),
        }
    }

    pub fn card(&self) -> usize {
        self.by_member.len()
    }

    /// Insert or rescore a member in O(log n) (delete then reinsert into the
    /// ordered side index).
    pub fn add(&mut self, member: Vec<u8>, score: f64, value: Vec<u8>) {
        if let Some((old_score, _)) = self.by_member.get(&member) {
            self.ordered.remove(&(Score(*old_score), member.clone()));
        }
        self.ordered.insert((Score(score), member.clone()));
        self.by_member.insert(member, (score, value));
    }

    pub fn rem(&mut self, member: &[u8]) -> bool {
        if let Some((score, _)) = self.by_member.remove(member) {
            self.ordered.remove(&(Score(score), member.to_vec()));
            true
        } else {
            false
        }
    }

    pub fn score(&self, member: &[u8]) -> Option<f64> {
        self.by_member.get(member).map(|(s, _)| *s)
    }

    pub fn get_by_key(&self, member: &[u8]) -> Option<(f64, Vec<u8>)> {
        self.by_member.get(member).cloned()
    }

    /// 0-based position in ascending (score, member) order.
    pub fn rank(&self, member: &[u8]) -> Option<usize> {
        let (score, _) = self.by_member.get(member)?;
        self.ordered
            .iter()
            .position(|(s, m)| *s == Score(*score) && m == member)
    }

    pub fn members(&self) -> Vec<(Vec<u8>, f64, Vec<u8>)> {
        self.ordered
            .iter()
            .map(|(s, m)| {
                let (_, v) = self.by_member.get(m).unwrap();
                (m.clone(), s.0, v.clone())
            })
            .collect()
    }

    /// 1-based inclusive rank range; negative ranks count from the end (`-1`
    /// is the highest-scoring member).
    pub fn range_by_rank(&self, start: i64, end: i64) -> Vec<(Vec<u8>, f64, Vec<u8>)> {
        let len = self.ordered.len() as i64;
        if len == 0 {
            return Vec::new();
        }
        let resolve = |r: i64| -> i64 {
            if r < 0 {
                len + r + 1
            } else {
                r
            }
        };
        let start = resolve(start).max(1);
        let end = resolve(end).min(len);
        if start > end {
            return Vec::new();
        }
        self.ordered
            .iter()
            .skip((start - 1) as usize)
            .take((end - start + 1) as usize)
            .map(|(s, m)| {
                let (_, v) = self.by_member.get(m).unwrap();
                (m.clone(), s.0, v.clone())
            })
            .collect()
    }

    /// Remove every member within the 1-based inclusive rank range. Returns
    /// the number removed.
    pub fn rem_range_by_rank(&mut self, start: i64, end: i64) -> usize {
        let victims: Vec<Vec<u8>> = self
            .range_by_rank(start, end)
            .into_iter()
            .map(|(m, _, _)| m)
            .collect();
        for m in &victims {
            self.rem(m);
        }
        victims.len()
    }

    fn in_score_range(score: f64, min: f64, max: f64, opts: &ScoreRangeOpts) -> bool {
        let lower_ok = if opts.exclude_start { score > min } else { score >= min };
        let upper_ok = if opts.exclude_end { score < max } else { score <= max };
        lower_ok && upper_ok
    }

    pub fn range_by_score(
        &self,
        min: f64,
        max: f64,
        opts: ScoreRangeOpts,
    ) -> Vec<(Vec<u8>, f64, Vec<u8>)> {
        let mut out = Vec::new();
        for (s, m) in &self.ordered {
            if Self::in_score_range(s.0, min, max, &opts) {
                let (_, v) = self.by_member.get(m).unwrap();
                out.push((m.clone(), s.0, v.clone()));
                if opts.limit > 0 && out.len() as i64 >= opts.limit {
                    break;
                }
            }
        }
        out
    }

    pub fn count(&self, min: f64, max: f64, opts: ScoreRangeOpts) -> usize {
        self.ordered
            .iter()
            .filter(|(s, _)| Self::in_score_range(s.0, min, max, &opts))
            .count()
    }

    pub fn peek_min(&self) -> Option<(Vec<u8>, f64, Vec<u8>)> {
        let (s, m) = self.ordered.iter().next()?;
        let (_, v) = self.by_member.get(m).unwrap();
        Some((m.clone(), s.0, v.clone()))
    }

    pub fn peek_max(&self) -> Option<(Vec<u8>, f64, Vec<u8>)> {
        let (s, m) = self.ordered.iter().next_back()?;
        let (_, v) = self.by_member.get(m).unwrap();
        Some((m.clone(), s.0, v.clone()))
    }

    pub fn pop_min(&mut self) -> Option<(Vec<u8>, f64, Vec<u8>)> {
        let entry = self.peek_min()?;
        self.rem(&entry.0);
        Some(entry)
    }

    pub fn pop_max(&mut self) -> Option<(Vec<u8>, f64, Vec<u8>)> {
        let entry = self.peek_max()?;
        self.rem(&entry.0);
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_by_score_is_ascending_and_tie_broken_by_member() {
        let mut z = ZSetState::new();
        z.add(b"k1".to_vec(), 70.0, b"v1".to_vec());
        z.add(b"k2".to_vec(), 90.0, b"v2".to_vec());
        z.add(b"k3".to_vec(), 86.0, b"v3".to_vec());
        let got = z.range_by_score(80.0, 100.0, ScoreRangeOpts::default());
        assert_eq!(
            got.into_iter().map(|(m, s, _)| (m, s)).collect::<Vec<_>>(),
            vec![(b"k3".to_vec(), 86.0), (b"k2".to_vec(), 90.0)]
        );
    }

    #[test]
    fn ties_break_by_member_lexicographic_order() {
        let mut z = ZSetState::new();
        z.add(b"bravo".to_vec(), 1.0, b"v".to_vec());
        z.add(b"alpha".to_vec(), 1.0, b"v".to_vec());
        let members: Vec<Vec<u8>> = z.members().into_iter().map(|(m, _, _)| m).collect();
        assert_eq!(members, vec![b"alpha".to_vec(), b"bravo".to_vec()]);
    }

    #[test]
    fn rescoring_moves_member_in_rank_order() {
        let mut z = ZSetState::new();
        z.add(b"a".to_vec(), 1.0, b"v".to_vec());
        z.add(b"b".to_vec(), 2.0, b"v".to_vec());
        assert_eq!(z.rank(b"a"), Some(0));
        z.add(b"a".to_vec(), 5.0, b"v".to_vec());
        assert_eq!(z.rank(b"a"), Some(1));
    }

    #[test]
    fn negative_rank_counts_from_the_end() {
        let mut z = ZSetState::new();
        z.add(b"a".to_vec(), 1.0, b"v".to_vec());
        z.add(b"b".to_vec(), 2.0, b"v".to_vec());
        z.add(b"c".to_vec(), 3.0, b"v".to_vec());
        let top = z.range_by_rank(-1, -1);
        assert_eq!(top[0].0, b"c".to_vec());
    }

    #[test]
    fn exclusive_bounds_drop_edge_scores() {
        let mut z = ZSetState::new();
        z.add(b"a".to_vec(), 10.0, b"v".to_vec());
        z.add(b"b".to_vec(), 20.0, b"v".to_vec());
        let opts = ScoreRangeOpts {
            limit: 0,
            exclude_start: true,
            exclude_end: false,
        };
        let got = z.range_by_score(10.0, 20.0, opts);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, b"b".to_vec());
    }
}
