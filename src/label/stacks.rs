//! Labeling applied across whole stacks.
//!
//! Each driver wraps an [`ImageStack`] and presents the labeled result as a
//! stack itself, computing on demand. Per-slice mode treats every slice
//! independently; whole-stack mode works on the assembled volume (so
//! components connect across z and labels are consistent between slices)
//! and memoizes the result for later reads.

use std::sync::Arc;

use log::debug;

use crate::dtype::{DataKind, ElementType};
use crate::error::{Error, Result};
use crate::image::Image;
use crate::source::SliceProps;
use crate::stack::core::StackCore;
use crate::stack::ImageStack;

use super::algo::{rank_against, rank_rows_against, LabelScalar};
use super::unique::{merge, merge_rows, unique_rows_sorted, unique_sorted};
use super::{
    label_volume, layout, narrowest, number_volume, relabel_volume, shrink_integer,
    to_label_image,
};

fn label_props(shape: (usize, usize)) -> SliceProps {
    SliceProps {
        element_type: ElementType::new(DataKind::UnsignedInt, 8)
            .expect("u64 is a supported type"),
        shape,
    }
}

/// Check the inner stack can be assembled into one volume.
fn require_volume_compatible(inner: &mut impl ImageStack) -> Result<()> {
    inner.uniform_shape()?;
    inner.uniform_element_type()?;
    Ok(())
}

/// Connected-component labeling over a stack.
pub struct LabelImageStack<S: ImageStack> {
    core: StackCore,
    inner: S,
    per_slice: bool,
    memo: Option<(Image, u64)>,
}

impl<S: ImageStack> LabelImageStack<S> {
    /// Label each slice independently with 4-connectivity.
    pub fn per_slice(inner: S) -> LabelImageStack<S> {
        let core = StackCore::with_len(inner.len());
        LabelImageStack {
            core,
            inner,
            per_slice: true,
            memo: None,
        }
    }

    /// Label the assembled volume with 6-connectivity, so components span
    /// slices. The stack must be shape and dtype homogeneous.
    pub fn whole_stack(mut inner: S) -> Result<LabelImageStack<S>> {
        require_volume_compatible(&mut inner)?;
        let core = StackCore::with_len(inner.len());
        Ok(LabelImageStack {
            core,
            inner,
            per_slice: false,
            memo: None,
        })
    }

    fn ensure_volume(&mut self) -> Result<()> {
        if self.memo.is_none() {
            let volume = self.inner.to_volume()?;
            let labeled = label_volume(&volume)?;
            debug!("labeled volume with {} components", labeled.1);
            self.memo = Some(labeled);
        }
        Ok(())
    }

    /// Total number of components. Only defined in whole-stack mode, where
    /// labels are consistent across slices; use
    /// [`slice_label_count`](Self::slice_label_count) otherwise.
    pub fn label_count(&mut self) -> Result<u64> {
        if self.per_slice {
            return Err(Error::validation(
                "per-slice labeling has no stack-wide label count",
            ));
        }
        self.ensure_volume()?;
        Ok(self.memo.as_ref().expect("memoized above").1)
    }

    /// Component count of one slice, labeled independently.
    pub fn slice_label_count(&mut self, z: usize) -> Result<u64> {
        let im = self.inner.read_slice(z)?;
        Ok(super::label(&im)?.1)
    }
}

impl<S: ImageStack> ImageStack for LabelImageStack<S> {
    fn core(&self) -> &StackCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StackCore {
        &mut self.core
    }

    fn resolve_props(&mut self, z: usize) -> Result<SliceProps> {
        Ok(label_props(self.inner.slice_props(z)?.shape))
    }

    fn load_slice(&mut self, z: usize) -> Result<Arc<Image>> {
        if self.per_slice {
            let im = self.inner.read_slice(z)?;
            Ok(Arc::new(super::label(&im)?.0))
        } else {
            self.ensure_volume()?;
            let volume = &self.memo.as_ref().expect("memoized above").0;
            Ok(Arc::new(volume.index_slice(z)))
        }
    }
}

/// Component-splitting relabeling over a stack; same two modes as
/// [`LabelImageStack`].
pub struct RelabelImageStack<S: ImageStack> {
    core: StackCore,
    inner: S,
    per_slice: bool,
    memo: Option<(Image, u64)>,
}

impl<S: ImageStack> RelabelImageStack<S> {
    pub fn per_slice(inner: S) -> RelabelImageStack<S> {
        let core = StackCore::with_len(inner.len());
        RelabelImageStack {
            core,
            inner,
            per_slice: true,
            memo: None,
        }
    }

    pub fn whole_stack(mut inner: S) -> Result<RelabelImageStack<S>> {
        require_volume_compatible(&mut inner)?;
        let core = StackCore::with_len(inner.len());
        Ok(RelabelImageStack {
            core,
            inner,
            per_slice: false,
            memo: None,
        })
    }

    fn ensure_volume(&mut self) -> Result<()> {
        if self.memo.is_none() {
            let volume = self.inner.to_volume()?;
            self.memo = Some(relabel_volume(&volume)?);
        }
        Ok(())
    }

    pub fn label_count(&mut self) -> Result<u64> {
        if self.per_slice {
            return Err(Error::validation(
                "per-slice relabeling has no stack-wide label count",
            ));
        }
        self.ensure_volume()?;
        Ok(self.memo.as_ref().expect("memoized above").1)
    }
}

impl<S: ImageStack> ImageStack for RelabelImageStack<S> {
    fn core(&self) -> &StackCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StackCore {
        &mut self.core
    }

    fn resolve_props(&mut self, z: usize) -> Result<SliceProps> {
        Ok(label_props(self.inner.slice_props(z)?.shape))
    }

    fn load_slice(&mut self, z: usize) -> Result<Arc<Image>> {
        if self.per_slice {
            let im = self.inner.read_slice(z)?;
            Ok(Arc::new(super::relabel(&im)?.0))
        } else {
            self.ensure_volume()?;
            let volume = &self.memo.as_ref().expect("memoized above").0;
            Ok(Arc::new(volume.index_slice(z)))
        }
    }
}

type SliceMap = Box<dyn Fn(&Image) -> Result<(Image, u64)>>;

enum NumberMode {
    /// Each slice numbered independently; labels are not consistent
    /// between slices.
    PerSlice { ordered: bool },
    /// One renumber pass over the assembled volume.
    WholeRenumber { memo: Option<(Image, u64)> },
    /// A unique-value table merged across all slices, then applied to each
    /// slice by search-sorted replacement. Works for heterogeneous shapes
    /// and always preserves value order, which satisfies both order modes.
    GlobalTable { map: Option<(SliceMap, u64)> },
}

/// Consecutive numbering over a stack, with consistent labels across
/// slices in the whole-stack modes.
pub struct ConsecutiveNumberStack<S: ImageStack> {
    core: StackCore,
    inner: S,
    mode: NumberMode,
}

impl<S: ImageStack> ConsecutiveNumberStack<S> {
    /// Number every slice on its own.
    pub fn per_slice(inner: S, ordered: bool) -> ConsecutiveNumberStack<S> {
        let core = StackCore::with_len(inner.len());
        ConsecutiveNumberStack {
            core,
            inner,
            mode: NumberMode::PerSlice { ordered },
        }
    }

    /// Number the stack as a whole, so one value maps to one label
    /// everywhere. Requires dtype homogeneity. The strategy is fixed here:
    /// unordered numbering of a shape-homogeneous stack renumbers the
    /// assembled volume directly; otherwise a global unique-value table is
    /// merged across slices and applied per slice.
    pub fn whole_stack(mut inner: S, ordered: bool) -> Result<ConsecutiveNumberStack<S>> {
        inner.uniform_element_type()?;
        let mode = if !ordered && inner.is_shape_homogeneous()? {
            NumberMode::WholeRenumber { memo: None }
        } else {
            NumberMode::GlobalTable { map: None }
        };
        let core = StackCore::with_len(inner.len());
        Ok(ConsecutiveNumberStack { core, inner, mode })
    }

    fn ensure_renumber(&mut self) -> Result<&(Image, u64)> {
        let NumberMode::WholeRenumber { memo } = &mut self.mode else {
            unreachable!("only called in renumber mode");
        };
        if memo.is_none() {
            let volume = self.inner.to_volume()?;
            *memo = Some(number_volume(&volume, false)?);
        }
        Ok(self
            .mode_renumber_memo()
            .expect("memoized above"))
    }

    fn mode_renumber_memo(&self) -> Option<&(Image, u64)> {
        match &self.mode {
            NumberMode::WholeRenumber { memo } => memo.as_ref(),
            _ => None,
        }
    }

    fn ensure_table(&mut self) -> Result<()> {
        let NumberMode::GlobalTable { map, .. } = &self.mode else {
            unreachable!("only called in table mode");
        };
        if map.is_some() {
            return Ok(());
        }
        let built = build_global_map(&mut self.inner)?;
        let NumberMode::GlobalTable { map, .. } = &mut self.mode else {
            unreachable!("mode does not change");
        };
        *map = Some(built);
        Ok(())
    }

    /// Highest label the numbering produces. Only defined in the
    /// whole-stack modes.
    pub fn max_label(&mut self) -> Result<u64> {
        match &self.mode {
            NumberMode::PerSlice { .. } => Err(Error::validation(
                "per-slice numbering has no stack-wide label count",
            )),
            NumberMode::WholeRenumber { .. } => Ok(self.ensure_renumber()?.1),
            NumberMode::GlobalTable { .. } => {
                self.ensure_table()?;
                match &self.mode {
                    NumberMode::GlobalTable { map: Some((_, n)), .. } => Ok(*n),
                    _ => unreachable!("table built above"),
                }
            }
        }
    }
}

impl<S: ImageStack> ImageStack for ConsecutiveNumberStack<S> {
    fn core(&self) -> &StackCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StackCore {
        &mut self.core
    }

    fn resolve_props(&mut self, z: usize) -> Result<SliceProps> {
        Ok(label_props(self.inner.slice_props(z)?.shape))
    }

    fn load_slice(&mut self, z: usize) -> Result<Arc<Image>> {
        match &self.mode {
            NumberMode::PerSlice { ordered } => {
                let ordered = *ordered;
                let im = self.inner.read_slice(z)?;
                Ok(Arc::new(super::number(&im, ordered)?.0))
            }
            NumberMode::WholeRenumber { .. } => {
                let volume = &self.ensure_renumber()?.0;
                let slice = volume.index_slice(z);
                Ok(Arc::new(slice))
            }
            NumberMode::GlobalTable { .. } => {
                self.ensure_table()?;
                let im = self.inner.read_slice(z)?;
                let NumberMode::GlobalTable { map: Some((f, _)), .. } = &self.mode else {
                    unreachable!("table built above");
                };
                Ok(Arc::new(f(&im)?.0))
            }
        }
    }
}

/// Merge unique values across every slice into a search-sorted replacement
/// map. Slices must all share the dtype of the first.
fn build_global_map(inner: &mut impl ImageStack) -> Result<(SliceMap, u64)> {
    let et = inner.uniform_element_type()?;
    if !et.is_integer() {
        return Err(Error::validation(format!(
            "numbering needs integer values, got {}",
            et.scalar()
        )));
    }
    let width = et.channels as usize;
    let depth = inner.len();

    macro_rules! build {
        ($var:ident, $t:ty) => {{
            if width == 1 {
                let mut table: Vec<$t> = Vec::new();
                for z in 0..depth {
                    let im = inner.read_slice(z)?;
                    let Image::$var(a) = im.as_ref() else {
                        return Err(Error::validation("slice dtype changed during scan"));
                    };
                    table = merge(&table, &unique_sorted(&Image::flat_values(a)));
                }
                let count = table.len() as u64
                    - u64::from(table.binary_search(&0).is_ok());
                debug!("global table holds {} distinct nonzero values", count);
                let f: SliceMap = Box::new(move |im: &Image| {
                    let (spatial, w) = layout(im, false)?;
                    let Image::$var(a) = im else {
                        return Err(Error::validation("slice dtype changed after scan"));
                    };
                    debug_assert_eq!(w, 1);
                    let (labels, n) = rank_against(&Image::flat_values(a), &table);
                    Ok((to_label_image(labels, &spatial)?, n))
                });
                Ok((f, count))
            } else {
                let zero = vec![<$t>::ZERO; width];
                let mut table: Vec<Vec<$t>> = Vec::new();
                for z in 0..depth {
                    let im = inner.read_slice(z)?;
                    let Image::$var(a) = im.as_ref() else {
                        return Err(Error::validation("slice dtype changed during scan"));
                    };
                    table = merge_rows(
                        &table,
                        &unique_rows_sorted(&Image::flat_values(a), width),
                    );
                }
                let count = table.len() as u64
                    - u64::from(table.binary_search_by(|r| r.as_slice().cmp(&zero)).is_ok());
                debug!("global table holds {} distinct nonzero rows", count);
                let f: SliceMap = Box::new(move |im: &Image| {
                    let (spatial, w) = layout(im, false)?;
                    let Image::$var(a) = im else {
                        return Err(Error::validation("slice dtype changed after scan"));
                    };
                    debug_assert_eq!(w, width);
                    let (labels, n) =
                        rank_rows_against(&Image::flat_values(a), width, &table);
                    Ok((to_label_image(labels, &spatial)?, n))
                });
                Ok((f, count))
            }
        }};
    }

    if depth == 0 {
        return Err(Error::validation("cannot number an empty stack"));
    }
    match inner.read_slice(0)?.as_ref() {
        Image::U8(_) => build!(U8, u8),
        Image::U16(_) => build!(U16, u16),
        Image::U32(_) => build!(U32, u32),
        Image::U64(_) => build!(U64, u64),
        Image::I8(_) => build!(I8, i8),
        Image::I16(_) => build!(I16, i16),
        Image::I32(_) => build!(I32, i32),
        Image::I64(_) => build!(I64, i64),
        other => Err(Error::validation(format!(
            "numbering needs integer values, got {}",
            other.scalar_type()
        ))),
    }
}

/// Integer-width shrinking over a stack.
pub struct ShrinkIntegerStack<S: ImageStack> {
    core: StackCore,
    inner: S,
    per_slice: bool,
    min_type: Option<ElementType>,
    /// Whole-stack target type, from the global value range.
    global: Option<ElementType>,
}

impl<S: ImageStack> ShrinkIntegerStack<S> {
    /// Shrink each slice to its own narrowest type.
    pub fn per_slice(inner: S, min_type: Option<ElementType>) -> ShrinkIntegerStack<S> {
        let core = StackCore::with_len(inner.len());
        ShrinkIntegerStack {
            core,
            inner,
            per_slice: true,
            min_type,
            global: None,
        }
    }

    /// Shrink every slice to one type that covers the whole stack's value
    /// range. Requires dtype homogeneity (the range is only meaningful for
    /// one signedness).
    pub fn whole_stack(
        mut inner: S,
        min_type: Option<ElementType>,
    ) -> Result<ShrinkIntegerStack<S>> {
        let et = inner.uniform_element_type()?;
        if !et.is_integer() {
            return Err(Error::validation(format!(
                "shrinking needs integer values, got {}",
                et.scalar()
            )));
        }
        let core = StackCore::with_len(inner.len());
        Ok(ShrinkIntegerStack {
            core,
            inner,
            per_slice: false,
            min_type,
            global: None,
        })
    }

    /// The whole-stack output type, computed from the global value range
    /// on first use.
    pub fn target_type(&mut self) -> Result<ElementType> {
        if self.per_slice {
            return Err(Error::validation(
                "per-slice shrinking has no single output type",
            ));
        }
        if let Some(t) = self.global {
            return Ok(t);
        }
        let (kind, min_bytes) = match self.min_type {
            Some(t) => (t.kind, t.bytes),
            None => (self.inner.uniform_element_type()?.scalar().kind, 1),
        };
        let mut range: Option<(i128, i128)> = None;
        for z in 0..self.inner.len() {
            let im = self.inner.read_slice(z)?;
            if let Some((mn, mx)) = im.int_min_max()? {
                range = Some(match range {
                    Some((gmn, gmx)) => (gmn.min(mn), gmx.max(mx)),
                    None => (mn, mx),
                });
            }
        }
        let (mn, mx) = range.unwrap_or((0, 0));
        if kind == DataKind::UnsignedInt && mn < 0 {
            return Err(Error::IncompatibleRange { min: mn, max: mx });
        }
        let t = narrowest(kind, min_bytes, mn, mx)?;
        debug!("stack shrinks to {}", t);
        self.global = Some(t);
        Ok(t)
    }
}

impl<S: ImageStack> ImageStack for ShrinkIntegerStack<S> {
    fn core(&self) -> &StackCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StackCore {
        &mut self.core
    }

    fn resolve_props(&mut self, z: usize) -> Result<SliceProps> {
        let inner_props = self.inner.slice_props(z)?;
        if self.per_slice {
            // the per-slice type depends on the values, so look at them
            let im = self.inner.read_slice(z)?;
            let shrunk = shrink_integer(&im, self.min_type)?;
            Ok(SliceProps::of(&shrunk))
        } else {
            let t = self.target_type()?;
            Ok(SliceProps {
                element_type: t
                    .with_channels(inner_props.element_type.channels)
                    .expect("channel count already validated"),
                shape: inner_props.shape,
            })
        }
    }

    fn load_slice(&mut self, z: usize) -> Result<Arc<Image>> {
        let im = self.inner.read_slice(z)?;
        if self.per_slice {
            Ok(Arc::new(shrink_integer(&im, self.min_type)?))
        } else {
            let t = self.target_type()?;
            Ok(Arc::new(im.cast_int(t)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::ArrayStack;
    use ndarray::Array3;

    fn three_slice_stack() -> ArrayStack {
        // values [[0,1],[0,0]], [[2,2],[0,0]], [[0,0],[0,0]]
        let mut vol = Array3::<u8>::zeros((3, 2, 2));
        vol[[0, 0, 1]] = 1;
        vol[[1, 0, 0]] = 2;
        vol[[1, 0, 1]] = 2;
        ArrayStack::new(Image::from(vol)).unwrap()
    }

    fn u64_at(im: &Image, idx: [usize; 2]) -> u64 {
        match im {
            Image::U64(a) => a[idx],
            _ => panic!("labels must be u64"),
        }
    }

    #[test]
    fn test_whole_stack_unordered_number_two_labels() {
        let mut stack =
            ConsecutiveNumberStack::whole_stack(three_slice_stack(), false).unwrap();
        assert_eq!(stack.max_label().unwrap(), 2);
        let s0 = stack.read_slice(0).unwrap();
        let s1 = stack.read_slice(1).unwrap();
        let s2 = stack.read_slice(2).unwrap();
        assert_eq!(u64_at(&s0, [0, 1]), 1);
        assert_eq!(u64_at(&s1, [0, 0]), 2);
        assert_eq!(u64_at(&s2, [0, 0]), 0);
    }

    #[test]
    fn test_whole_stack_ordered_uses_table() {
        let mut stack =
            ConsecutiveNumberStack::whole_stack(three_slice_stack(), true).unwrap();
        assert_eq!(stack.max_label().unwrap(), 2);
        // ordered: value 1 -> label 1, value 2 -> label 2, on every slice
        let s0 = stack.read_slice(0).unwrap();
        let s1 = stack.read_slice(1).unwrap();
        assert_eq!(u64_at(&s0, [0, 1]), 1);
        assert_eq!(u64_at(&s1, [0, 0]), 2);
    }

    #[test]
    fn test_per_slice_number_restarts_labels() {
        let mut stack = ConsecutiveNumberStack::per_slice(three_slice_stack(), true);
        assert!(stack.max_label().is_err());
        let s0 = stack.read_slice(0).unwrap();
        let s1 = stack.read_slice(1).unwrap();
        // each slice numbers from 1 again
        assert_eq!(u64_at(&s0, [0, 1]), 1);
        assert_eq!(u64_at(&s1, [0, 0]), 1);
    }

    #[test]
    fn test_label_stack_connects_across_z() {
        // one voxel blob spanning slices 0 and 1 at the same (y, x)
        let mut vol = Array3::<u8>::zeros((2, 2, 2));
        vol[[0, 0, 0]] = 5;
        vol[[1, 0, 0]] = 9;
        let inner = ArrayStack::new(Image::from(vol.clone())).unwrap();
        let mut whole = LabelImageStack::whole_stack(inner).unwrap();
        assert_eq!(whole.label_count().unwrap(), 1);

        let inner = ArrayStack::new(Image::from(vol)).unwrap();
        let mut per = LabelImageStack::per_slice(inner);
        assert!(per.label_count().is_err());
        assert_eq!(per.slice_label_count(0).unwrap(), 1);
        let s1 = per.read_slice(1).unwrap();
        assert_eq!(u64_at(&s1, [0, 0]), 1);
    }

    #[test]
    fn test_relabel_stack_splits_within_volume() {
        // the same value in two z-separated blobs splits in whole-stack mode
        let mut vol = Array3::<u8>::zeros((3, 1, 1));
        vol[[0, 0, 0]] = 4;
        vol[[2, 0, 0]] = 4;
        let inner = ArrayStack::new(Image::from(vol)).unwrap();
        let mut stack = RelabelImageStack::whole_stack(inner).unwrap();
        assert_eq!(stack.label_count().unwrap(), 2);
        let s0 = stack.read_slice(0).unwrap();
        let s2 = stack.read_slice(2).unwrap();
        assert_ne!(u64_at(&s0, [0, 0]), u64_at(&s2, [0, 0]));
    }

    #[test]
    fn test_shrink_stack_whole_picks_global_type() {
        let mut vol = Array3::<u32>::zeros((2, 2, 2));
        vol[[0, 0, 0]] = 3;
        vol[[1, 1, 1]] = 70_000;
        let inner = ArrayStack::new(Image::from(vol)).unwrap();
        let mut stack = ShrinkIntegerStack::whole_stack(inner, None).unwrap();
        assert_eq!(
            stack.target_type().unwrap(),
            ElementType::new(DataKind::UnsignedInt, 4).unwrap()
        );
        assert!(matches!(&*stack.read_slice(0).unwrap(), Image::U32(_)));
    }

    #[test]
    fn test_shrink_stack_per_slice_varies() {
        let mut vol = Array3::<u32>::zeros((2, 2, 2));
        vol[[0, 0, 0]] = 3;
        vol[[1, 1, 1]] = 70_000;
        let inner = ArrayStack::new(Image::from(vol)).unwrap();
        let mut stack = ShrinkIntegerStack::per_slice(inner, None);
        assert!(matches!(&*stack.read_slice(0).unwrap(), Image::U8(_)));
        assert!(matches!(&*stack.read_slice(1).unwrap(), Image::U32(_)));
        assert!(stack.target_type().is_err());
    }
}
