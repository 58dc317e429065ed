//! Sorted-set differ.
//!
//! Walks two sequences sorted by the same total order in lockstep and splits
//! them into three partitions:
//!
//! | partition   | present in `published` | present in `wanted` |
//! |-------------|------------------------|---------------------|
//! | `removed`   | yes                    | no                  |
//! | `added`     | no                     | yes                 |
//! | `unchanged` | yes                    | yes                 |
//!
//! Applying the result to `published` (drop `removed`, insert `added`) yields
//! exactly `wanted`.

use std::cmp::Ordering;

/// Result of [`diff_sorted`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortedDiff<T> {
    pub added: Vec<T>,
    pub removed: Vec<T>,
    /// Items in both inputs, taken from `published`.
    pub unchanged: Vec<T>,
}

impl<T> Default for SortedDiff<T> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            removed: Vec::new(),
            unchanged: Vec::new(),
        }
    }
}

impl<T> SortedDiff<T> {
    /// True when `published` and `wanted` held the same keys.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Diff two slices that are both sorted by `cmp` and free of duplicates.
///
/// Runs in `O(published + wanted)`. Output partitions keep input order.
pub fn diff_sorted<T, F>(published: &[T], wanted: &[T], mut cmp: F) -> SortedDiff<T>
where
    T: Clone,
    F: FnMut(&T, &T) -> Ordering,
{
    debug_assert!(is_strictly_sorted(published, &mut cmp), "published not sorted");
    debug_assert!(is_strictly_sorted(wanted, &mut cmp), "wanted not sorted");

    let mut diff = SortedDiff::default();
    let (mut i, mut j) = (0, 0);

    while i < published.len() && j < wanted.len() {
        match cmp(&published[i], &wanted[j]) {
            Ordering::Less => {
                diff.removed.push(published[i].clone());
                i += 1;
            }
            Ordering::Greater => {
                diff.added.push(wanted[j].clone());
                j += 1;
            }
            Ordering::Equal => {
                diff.unchanged.push(published[i].clone());
                i += 1;
                j += 1;
            }
        }
    }
    diff.removed.extend_from_slice(&published[i..]);
    diff.added.extend_from_slice(&wanted[j..]);
    diff
}

/// [`diff_sorted`] using the natural order of `T`.
pub fn diff_sorted_keys<T: Ord + Clone>(published: &[T], wanted: &[T]) -> SortedDiff<T> {
    diff_sorted(published, wanted, T::cmp)
}

fn is_strictly_sorted<T, F>(items: &[T], cmp: &mut F) -> bool
where
    F: FnMut(&T, &T) -> Ordering,
{
    items.windows(2).all(|w| cmp(&w[0], &w[1]) == Ordering::Less)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(&[], &[], &[], &[], &[])]
    #[case(&[1, 2, 3], &[1, 2, 3], &[], &[], &[1, 2, 3])]
    #[case(&[], &[1, 2], &[1, 2], &[], &[])]
    #[case(&[1, 2], &[], &[], &[1, 2], &[])]
    #[case(&[1, 3, 5], &[2, 3, 4], &[2, 4], &[1, 5], &[3])]
    #[case(&[1, 2], &[3, 4], &[3, 4], &[1, 2], &[])]
    fn partitions(
        #[case] published: &[u32],
        #[case] wanted: &[u32],
        #[case] added: &[u32],
        #[case] removed: &[u32],
        #[case] unchanged: &[u32],
    ) {
        let diff = diff_sorted_keys(published, wanted);
        assert_eq!(diff.added, added);
        assert_eq!(diff.removed, removed);
        assert_eq!(diff.unchanged, unchanged);
    }

    #[test]
    fn custom_order_is_respected() {
        let published = ["c", "b", "a"];
        let wanted = ["d", "b"];
        let diff = diff_sorted(&published, &wanted, |x, y| y.cmp(x));
        assert_eq!(diff.added, ["d"]);
        assert_eq!(diff.removed, ["c", "a"]);
        assert_eq!(diff.unchanged, ["b"]);
    }

    /// Every pair of subsets of a small universe: applying the diff to
    /// `published` must give `wanted`, and `added`/`removed` never overlap.
    #[test]
    fn applying_diff_reaches_wanted_for_all_small_sets() {
        const UNIVERSE: u32 = 6;
        let subset = |mask: u32| -> Vec<u32> { (0..UNIVERSE).filter(|b| mask & (1 << b) != 0).collect() };

        for a in 0..(1u32 << UNIVERSE) {
            for b in 0..(1u32 << UNIVERSE) {
                let published = subset(a);
                let wanted = subset(b);
                let diff = diff_sorted_keys(&published, &wanted);

                let added: BTreeSet<_> = diff.added.iter().copied().collect();
                let removed: BTreeSet<_> = diff.removed.iter().copied().collect();
                assert!(added.is_disjoint(&removed), "a={a:#b} b={b:#b}");

                let mut after: BTreeSet<_> = published.iter().copied().collect();
                after.retain(|x| !removed.contains(x));
                after.extend(added);
                let wanted_set: BTreeSet<_> = wanted.iter().copied().collect();
                assert_eq!(after, wanted_set, "a={a:#b} b={b:#b}");
            }
        }
    }
}
