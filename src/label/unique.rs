//! Sorted-unique primitives shared by the numbering code.
//!
//! Values are scalars or fixed-width rows (one row per multichannel pixel).
//! Everything here works on sorted, duplicate-free vectors so lookups can
//! binary search and tables from different slices merge linearly.

/// Sorted distinct values of `values`.
pub(crate) fn unique_sorted<T: Ord + Copy>(values: &[T]) -> Vec<T> {
    let mut out = values.to_vec();
    out.sort_unstable();
    out.dedup();
    out
}

/// Sorted distinct rows of a flat buffer of `width`-sized chunks.
///
/// `flat.len()` must be a multiple of `width`.
pub(crate) fn unique_rows_sorted<T: Ord + Copy>(flat: &[T], width: usize) -> Vec<Vec<T>> {
    let mut out: Vec<Vec<T>> = flat.chunks_exact(width).map(|r| r.to_vec()).collect();
    out.sort_unstable();
    out.dedup();
    out
}

/// Merge two sorted duplicate-free vectors into one. The result is again
/// sorted and duplicate-free; merging with an empty vector returns the
/// other side unchanged.
pub(crate) fn merge<T: Ord + Copy>(a: &[T], b: &[T]) -> Vec<T> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => {
                out.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                out.push(b[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

/// Row-valued [`merge`].
pub(crate) fn merge_rows<T: Ord + Copy>(a: &[Vec<T>], b: &[Vec<T>]) -> Vec<Vec<T>> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => {
                out.push(a[i].clone());
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                out.push(b[j].clone());
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                out.push(a[i].clone());
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_sorted() {
        assert_eq!(unique_sorted(&[3, 1, 2, 1, 3, 3]), vec![1, 2, 3]);
        assert_eq!(unique_sorted::<i32>(&[]), Vec::<i32>::new());
    }

    #[test]
    fn test_unique_rows() {
        let flat = [1, 2, 1, 2, 0, 0, 1, 2];
        let rows = unique_rows_sorted(&flat, 2);
        assert_eq!(rows, vec![vec![0, 0], vec![1, 2]]);
    }

    #[test]
    fn test_merge_properties() {
        assert_eq!(merge(&[1, 3, 5], &[2, 3, 4]), vec![1, 2, 3, 4, 5]);
        // identity with the empty vector
        assert_eq!(merge(&[1, 2], &[]), vec![1, 2]);
        assert_eq!(merge::<i32>(&[], &[1, 2]), vec![1, 2]);
        // idempotent
        assert_eq!(merge(&[1, 2], &[1, 2]), vec![1, 2]);
    }

    #[test]
    fn test_merge_rows() {
        let a = vec![vec![0, 1], vec![2, 2]];
        let b = vec![vec![0, 1], vec![1, 0]];
        assert_eq!(
            merge_rows(&a, &b),
            vec![vec![0, 1], vec![1, 0], vec![2, 2]]
        );
    }
}
