//! Counting and indexing of report states.
//!
//! A report state is a multiset of (trigger data, window slot) reports. Each
//! trigger-data value is a "type" with `slots` distinguishable positions
//! (report windows times destination surfaces) and at most `cap` reports;
//! the total number of reports is bounded by `max_reports`.

/// `C(n, k)`, saturating at `u128::MAX`.
pub fn binomial(n: u128, k: u128) -> u128 {
    if k > n {
        return 0;
    }
    let k = k.min(n - k);
    let mut result: u128 = 1;
    for i in 0..k {
        // C(n, i) * (n - i) = C(n, i + 1) * (i + 1), so the division is exact.
        result = match result.checked_mul(n - i) {
            Some(product) => product / (i + 1),
            None => return u128::MAX,
        };
    }
    result
}

/// Number of multisets of size `size` drawn from `slots` elements.
pub fn multisets(slots: u128, size: u128) -> u128 {
    match (slots, size) {
        (_, 0) => 1,
        (0, _) => 0,
        _ => binomial(slots + size - 1, size),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeBounds {
    pub slots: usize,
    pub cap: usize,
}

/// Indexable space of report states.
#[derive(Debug, Clone)]
pub struct StateSpace {
    types: Vec<TypeBounds>,
    max_reports: usize,
    /// `suffix[i][r]`: states reachable using types `i..` with at most `r`
    /// reports left.
    suffix: Vec<Vec<u128>>,
}

impl StateSpace {
    pub fn new(types: Vec<TypeBounds>, max_reports: usize) -> Self {
        let n = types.len();
        let mut suffix = vec![vec![1u128; max_reports + 1]; n + 1];
        for i in (0..n).rev() {
            for remaining in 0..=max_reports {
                let bounds = types[i];
                let mut total: u128 = 0;
                for j in 0..=bounds.cap.min(remaining) {
                    let term = multisets(bounds.slots as u128, j as u128)
                        .saturating_mul(suffix[i + 1][remaining - j]);
                    total = total.saturating_add(term);
                }
                suffix[i][remaining] = total;
            }
        }
        Self {
            types,
            max_reports,
            suffix,
        }
    }

    /// Total number of report states, including the empty one. Saturates at
    /// `u128::MAX` for absurd configurations.
    pub fn num_states(&self) -> u128 {
        self.suffix[0][self.max_reports]
    }

    pub fn types(&self) -> &[TypeBounds] {
        &self.types
    }

    /// Maps `index` in `[0, num_states)` to the (type, slot) reports of that
    /// state. Index 0 is always the empty state.
    pub fn decode(&self, mut index: u128) -> Option<Vec<(usize, usize)>> {
        if index >= self.num_states() {
            return None;
        }
        let mut reports = Vec::new();
        let mut remaining = self.max_reports;
        for (type_index, bounds) in self.types.iter().enumerate() {
            let mut chosen = None;
            for j in 0..=bounds.cap.min(remaining) {
                let rest = self.suffix[type_index + 1][remaining - j];
                let block = multisets(bounds.slots as u128, j as u128).saturating_mul(rest);
                if index < block {
                    chosen = Some((j, index / rest, index % rest));
                    break;
                }
                index -= block;
            }
            let (count, multiset_index, rest_index) = chosen?;
            for slot in decode_multiset(bounds.slots, count, multiset_index) {
                reports.push((type_index, slot));
            }
            remaining -= count;
            index = rest_index;
        }
        Some(reports)
    }
}

/// Lexicographic unranking of a non-decreasing sequence of `size` slots out
/// of `slots`.
fn decode_multiset(slots: usize, size: usize, mut index: u128) -> Vec<usize> {
    let mut result = Vec::with_capacity(size);
    let mut lowest = 0;
    for position in 0..size {
        let left_after = (size - position - 1) as u128;
        for slot in lowest..slots {
            let count = multisets((slots - slot) as u128, left_after);
            if index < count {
                result.push(slot);
                lowest = slot;
                break;
            }
            index -= count;
        }
    }
    result
}
