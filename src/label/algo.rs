//! Label assignment kernels over flat pixel buffers.
//!
//! All kernels take row-major buffers plus explicit dimensions so 2D slices
//! and 3D volumes share the same code. Labels are `u64`, with 0 reserved
//! for the zero value; every produced labeling is contiguous from 1.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use super::unique::{unique_rows_sorted, unique_sorted};

/// Integer scalars that can carry label source values.
pub(crate) trait LabelScalar: Copy + Ord + Eq + Hash {
    const ZERO: Self;
}

macro_rules! impl_label_scalar {
    ($($t:ty),*) => { $(
        impl LabelScalar for $t {
            const ZERO: Self = 0;
        }
    )* };
}
impl_label_scalar!(u8, u16, u32, u64, i8, i16, i32, i64);

/// How much each rank in a sorted table shifts to make labels contiguous
/// from 1 with the zero value pinned to 0.
///
/// With no zero present, labels are rank + 1. With the zero value at rank
/// `p`, ranks below `p` shift up by one, rank `p` maps to 0 and ranks above
/// stay as-is, so the zero value never consumes a label.
struct ZeroCorrection {
    zero_rank: Option<usize>,
    /// Count of distinct nonzero values, which is also the highest label.
    count: u64,
}

impl ZeroCorrection {
    fn new(zero_rank: Result<usize, usize>, table_len: usize) -> ZeroCorrection {
        match zero_rank {
            Ok(p) => ZeroCorrection {
                zero_rank: Some(p),
                count: (table_len - 1) as u64,
            },
            Err(_) => ZeroCorrection {
                zero_rank: None,
                count: table_len as u64,
            },
        }
    }

    fn label_of(&self, rank: usize) -> u64 {
        match self.zero_rank {
            None => (rank + 1) as u64,
            Some(p) if rank < p => (rank + 1) as u64,
            Some(p) if rank == p => 0,
            Some(_) => rank as u64,
        }
    }
}

/// Label every value by its rank in a sorted duplicate-free table that
/// contains all of them. Returns the labels and the label count.
pub(crate) fn rank_against<T: LabelScalar>(flat: &[T], table: &[T]) -> (Vec<u64>, u64) {
    let correction = ZeroCorrection::new(table.binary_search(&T::ZERO), table.len());
    let labels = flat
        .iter()
        .map(|v| {
            let rank = table.binary_search(v).expect("table covers all values");
            correction.label_of(rank)
        })
        .collect();
    (labels, correction.count)
}

/// Row-valued [`rank_against`]; rows are `width`-sized chunks of `flat`.
pub(crate) fn rank_rows_against<T: LabelScalar>(
    flat: &[T],
    width: usize,
    table: &[Vec<T>],
) -> (Vec<u64>, u64) {
    let zero = vec![T::ZERO; width];
    let correction = ZeroCorrection::new(
        table.binary_search_by(|r| r.as_slice().cmp(&zero)),
        table.len(),
    );
    let labels = flat
        .chunks_exact(width)
        .map(|row| {
            let rank = table
                .binary_search_by(|r| r.as_slice().cmp(row))
                .expect("table covers all rows");
            correction.label_of(rank)
        })
        .collect();
    (labels, correction.count)
}

/// Number values by sorted order: distinct nonzero values get 1..=n by
/// ascending value, zeros get 0.
pub(crate) fn number_values<T: LabelScalar>(flat: &[T]) -> (Vec<u64>, u64) {
    rank_against(flat, &unique_sorted(flat))
}

/// Row-valued [`number_values`].
pub(crate) fn number_rows<T: LabelScalar>(flat: &[T], width: usize) -> (Vec<u64>, u64) {
    rank_rows_against(flat, width, &unique_rows_sorted(flat, width))
}

/// Number values by first appearance in scan order: the first distinct
/// nonzero value becomes 1, the next 2, and so on. Zeros stay 0.
pub(crate) fn renumber_values<T: LabelScalar>(flat: &[T]) -> (Vec<u64>, u64) {
    let mut seen: HashMap<T, u64> = HashMap::new();
    let mut next = 1u64;
    let labels = flat
        .iter()
        .map(|&v| {
            if v == T::ZERO {
                0
            } else {
                *seen.entry(v).or_insert_with(|| {
                    let id = next;
                    next += 1;
                    id
                })
            }
        })
        .collect();
    (labels, next - 1)
}

/// Row-valued [`renumber_values`].
pub(crate) fn renumber_rows<T: LabelScalar>(flat: &[T], width: usize) -> (Vec<u64>, u64) {
    let zero = vec![T::ZERO; width];
    let mut seen: HashMap<Vec<T>, u64> = HashMap::new();
    let mut next = 1u64;
    let labels = flat
        .chunks_exact(width)
        .map(|row| {
            if row == zero.as_slice() {
                0
            } else {
                *seen.entry(row.to_vec()).or_insert_with(|| {
                    let id = next;
                    next += 1;
                    id
                })
            }
        })
        .collect();
    (labels, next - 1)
}

/// Row-major strides for `dims`.
fn strides(dims: &[usize]) -> Vec<usize> {
    let mut out = vec![1; dims.len()];
    for i in (0..dims.len().saturating_sub(1)).rev() {
        out[i] = out[i + 1] * dims[i + 1];
    }
    out
}

/// Push the face-adjacent neighbors of `idx` (4-connectivity in 2D,
/// 6-connectivity in 3D).
fn push_neighbors(idx: usize, dims: &[usize], strides: &[usize], out: &mut Vec<usize>) {
    out.clear();
    let mut rem = idx;
    for (&dim, &stride) in dims.iter().zip(strides) {
        let coord = rem / stride;
        rem %= stride;
        if coord > 0 {
            out.push(idx - stride);
        }
        if coord + 1 < dim {
            out.push(idx + stride);
        }
    }
}

/// Connected components of the foreground mask, labeled 1..=n in order of
/// each component's first pixel in scan order. Background stays 0.
pub(crate) fn label_components(foreground: &[bool], dims: &[usize]) -> (Vec<u64>, u64) {
    debug_assert_eq!(foreground.len(), dims.iter().product::<usize>());
    let strides = strides(dims);
    let mut labels = vec![0u64; foreground.len()];
    let mut count = 0u64;
    let mut queue = VecDeque::new();
    let mut neighbors = Vec::with_capacity(dims.len() * 2);
    for start in 0..foreground.len() {
        if !foreground[start] || labels[start] != 0 {
            continue;
        }
        count += 1;
        labels[start] = count;
        queue.push_back(start);
        while let Some(idx) = queue.pop_front() {
            push_neighbors(idx, dims, &strides, &mut neighbors);
            for &n in &neighbors {
                if foreground[n] && labels[n] == 0 {
                    labels[n] = count;
                    queue.push_back(n);
                }
            }
        }
    }
    (labels, count)
}

/// Split each label into its connected components. Adjacency requires equal
/// nonzero labels; the component containing the first-scanned pixel of a
/// label keeps it, further components of the same label get fresh labels
/// past `count`. The result is contiguous again.
pub(crate) fn split_components(labels: &[u64], dims: &[usize], count: u64) -> (Vec<u64>, u64) {
    debug_assert_eq!(labels.len(), dims.iter().product::<usize>());
    let strides = strides(dims);
    let mut out = vec![0u64; labels.len()];
    let mut seen = vec![false; (count + 1) as usize];
    let mut total = count;
    let mut queue = VecDeque::new();
    let mut neighbors = Vec::with_capacity(dims.len() * 2);
    for start in 0..labels.len() {
        let v = labels[start];
        if v == 0 || out[start] != 0 {
            continue;
        }
        let id = if seen[v as usize] {
            total += 1;
            total
        } else {
            seen[v as usize] = true;
            v
        };
        out[start] = id;
        queue.push_back(start);
        while let Some(idx) = queue.pop_front() {
            push_neighbors(idx, dims, &strides, &mut neighbors);
            for &n in &neighbors {
                if labels[n] == v && out[n] == 0 {
                    out[n] = id;
                    queue.push_back(n);
                }
            }
        }
    }
    (out, total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_pins_zero() {
        let (labels, n) = number_values(&[5i64, 0, 3, 5, 0]);
        assert_eq!(labels, vec![2, 0, 1, 2, 0]);
        assert_eq!(n, 2);
    }

    #[test]
    fn test_number_negative_values() {
        // zero sits mid-table; labels stay contiguous with 0 pinned
        let (labels, n) = number_values(&[-2i8, 0, 4, -2, 7]);
        assert_eq!(labels, vec![1, 0, 2, 1, 3]);
        assert_eq!(n, 3);
    }

    #[test]
    fn test_number_without_zeros() {
        let (labels, n) = number_values(&[9u8, 4, 9]);
        assert_eq!(labels, vec![2, 1, 2]);
        assert_eq!(n, 2);
    }

    #[test]
    fn test_renumber_first_seen_order() {
        let (labels, n) = renumber_values(&[7u16, 0, 3, 7, 9]);
        assert_eq!(labels, vec![1, 0, 2, 1, 3]);
        assert_eq!(n, 3);
    }

    #[test]
    fn test_rows_zero_is_all_zero_row() {
        // rows: (1,0) is nonzero, (0,0) is the zero pixel
        let flat = [1u8, 0, 0, 0, 1, 0];
        let (labels, n) = number_rows(&flat, 2);
        assert_eq!(labels, vec![1, 0, 1]);
        assert_eq!(n, 1);
    }

    #[test]
    fn test_label_components_2d() {
        // two diagonal blobs do not touch under 4-connectivity
        let fg = [
            true, false, false, //
            false, true, true, //
            false, true, false,
        ];
        let (labels, n) = label_components(&fg, &[3, 3]);
        assert_eq!(n, 2);
        assert_eq!(labels[0], 1);
        assert_eq!(labels[4], 2);
        assert_eq!(labels[5], 2);
        assert_eq!(labels[7], 2);
    }

    #[test]
    fn test_label_components_3d_connects_across_planes() {
        // same (y, x) in adjacent planes is connected
        let mut fg = vec![false; 2 * 2 * 2];
        fg[0] = true; // (0,0,0)
        fg[4] = true; // (1,0,0)
        let (labels, n) = label_components(&fg, &[2, 2, 2]);
        assert_eq!(n, 1);
        assert_eq!(labels[0], 1);
        assert_eq!(labels[4], 1);
    }

    #[test]
    fn test_split_components_mints_new_labels() {
        // label 1 appears as two disconnected pieces
        let labels = [
            1, 1, 0, //
            0, 1, 2, //
            1, 0, 2,
        ];
        let (out, n) = split_components(&labels, &[3, 3], 2);
        assert_eq!(n, 3);
        // first piece keeps 1, second piece gets 3, label 2 is untouched
        assert_eq!(out[0], 1);
        assert_eq!(out[1], 1);
        assert_eq!(out[4], 1);
        assert_eq!(out[6], 3);
        assert_eq!(out[5], 2);
        assert_eq!(out[8], 2);
    }

    #[test]
    fn test_split_components_noop_when_connected() {
        let labels = [1, 1, 2, 2];
        let (out, n) = split_components(&labels, &[2, 2], 2);
        assert_eq!(out, vec![1, 1, 2, 2]);
        assert_eq!(n, 2);
    }
}
