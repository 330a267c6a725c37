//! Writable stacks backed by on-disk storage.
//!
//! A [`StackBackend`] does the per-slice I/O for one format; the
//! [`FileImageStack`] wrapped around it owns indexing, validation, the
//! header and the cache. Formats construct these through
//! [`registry::FileFormat`](super::registry::FileFormat).

use std::sync::Arc;

use log::debug;

use crate::error::{Error, Result};
use crate::image::{check_image, Image};
use crate::source::{ImageSource, SliceProps};

use super::core::{SliceState, StackCore};
use super::header::Header;
use super::{ImageStack, IndexSpec};

/// Per-slice storage operations implemented by each file format.
///
/// Indices passed in are always in bounds for the current depth (except
/// `insert_slice`, where `z` may equal the depth). Write and insert must
/// validate everything that can fail before mutating the store, so a
/// returned error leaves the slice unchanged.
pub trait StackBackend {
    /// Properties of slice `z` without loading its pixels, where possible.
    fn slice_props(&mut self, z: usize) -> Result<SliceProps>;

    /// Load slice `z`.
    fn read_slice(&mut self, z: usize) -> Result<Arc<Image>>;

    /// Replace slice `z` with `im`, returning the stored properties.
    fn write_slice(&mut self, z: usize, im: &Image) -> Result<SliceProps>;

    /// Insert `im` so it becomes slice `z`, shifting later slices up.
    fn insert_slice(&mut self, z: usize, im: &Image) -> Result<SliceProps>;

    /// Remove slices `start..stop`, shifting later slices down.
    fn delete_range(&mut self, start: usize, stop: usize) -> Result<()>;

    /// Persist the header.
    fn save_header(&mut self, header: &Header) -> Result<()>;
}

/// A stack stored in a file or directory, open for reading and optionally
/// for writing.
pub struct FileImageStack {
    core: StackCore,
    header: Header,
    backend: Box<dyn StackBackend>,
    readonly: bool,
}

impl FileImageStack {
    pub fn new(
        backend: Box<dyn StackBackend>,
        header: Header,
        depth: usize,
        readonly: bool,
    ) -> FileImageStack {
        FileImageStack {
            core: StackCore::with_len(depth),
            header,
            backend,
            readonly,
        }
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    /// Persist the header through the backend.
    pub fn save(&mut self) -> Result<()> {
        if self.readonly {
            return Err(Error::ReadOnly);
        }
        self.backend.save_header(&self.header)
    }

    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// Load and validate every source up front so a bad source fails the
    /// whole operation before any slice is touched.
    fn collect_images(mut sources: Vec<ImageSource>) -> Result<Vec<Arc<Image>>> {
        sources
            .iter_mut()
            .map(|s| {
                let im = s.data()?;
                check_image(&im)?;
                Ok(im)
            })
            .collect()
    }

    fn write_at(&mut self, z: usize, im: &Arc<Image>) -> Result<()> {
        let props = self.backend.write_slice(z, im)?;
        self.core.touch(z);
        self.core.store(z, Arc::clone(im));
        self.core.note_write(z, props);
        Ok(())
    }

    /// Insert images so the first becomes slice `idx`. Each slice is
    /// committed separately; a failure partway through leaves the earlier
    /// inserts in place.
    fn insert_images(&mut self, idx: usize, images: &[Arc<Image>]) -> Result<()> {
        for (k, im) in images.iter().enumerate() {
            let z = idx + k;
            let props = self.backend.insert_slice(z, im)?;
            self.core
                .after_insert(z, vec![SliceState::with_props(props)]);
            self.core.touch(z);
            self.core.store(z, Arc::clone(im));
            self.header.update_depth(self.core.len());
        }
        Ok(())
    }

    /// Replace the slices a spec selects with the given sources.
    ///
    /// A single index may also equal the depth to append. A unit-step range
    /// grows or shrinks the stack when the source count differs from the
    /// range length; a range with |step| > 1 requires an exact count. A
    /// list pairs indices and sources one to one, where an index equal to
    /// the depth reached so far appends.
    pub fn set(&mut self, spec: &IndexSpec, sources: Vec<ImageSource>) -> Result<()> {
        self.check_writable()?;
        let len = self.core.len();
        match spec {
            IndexSpec::At(i) => {
                if sources.len() != 1 {
                    return Err(Error::validation(format!(
                        "a single index takes exactly one image, got {}",
                        sources.len()
                    )));
                }
                let n = len as isize;
                let j = if *i < 0 { i + n } else { *i };
                if j < 0 || j > n {
                    return Err(Error::Index { index: *i, len });
                }
                let images = Self::collect_images(sources)?;
                if j == n {
                    self.insert_images(len, &images)
                } else {
                    self.write_at(j as usize, &images[0])
                }
            }
            IndexSpec::Range { step, .. } if *step == 1 || *step == -1 => {
                let backward = *step == -1;
                let (lo, hi) = spec.unit_window(len).expect("unit step here");
                let window = hi - lo;
                let images = Self::collect_images(sources)?;
                let n = images.len();
                for (k, im) in images.iter().take(window.min(n)).enumerate() {
                    let z = if backward { hi - 1 - k } else { lo + k };
                    self.write_at(z, im)?;
                }
                if n < window {
                    // surplus window, shrink: the unwritten part goes away
                    let range = if backward {
                        (lo, hi - n)
                    } else {
                        (lo + n, hi)
                    };
                    self.delete_ranges(&[range])
                } else if n > window {
                    // surplus images, grow just past the window in traversal
                    // direction
                    let at = if backward { lo } else { hi };
                    let mut extras: Vec<Arc<Image>> = images[window..].to_vec();
                    if backward {
                        extras.reverse();
                    }
                    self.insert_images(at, &extras)
                } else {
                    Ok(())
                }
            }
            IndexSpec::Range { .. } => {
                let idxs = spec.indices(len)?;
                if sources.len() != idxs.len() {
                    return Err(Error::validation(format!(
                        "strided range selects {} slices but {} images were given",
                        idxs.len(),
                        sources.len()
                    )));
                }
                let images = Self::collect_images(sources)?;
                for (z, im) in idxs.iter().zip(&images) {
                    self.write_at(*z, im)?;
                }
                Ok(())
            }
            IndexSpec::List(list) => {
                if sources.len() != list.len() {
                    return Err(Error::validation(format!(
                        "index list has {} entries but {} images were given",
                        list.len(),
                        sources.len()
                    )));
                }
                // validate all indices against the depth as it would evolve
                let mut d = len as isize;
                let mut resolved = Vec::with_capacity(list.len());
                for &i in list {
                    let j = if i < 0 { i + d } else { i };
                    if j < 0 || j > d {
                        return Err(Error::Index { index: i, len: d as usize });
                    }
                    if j == d {
                        d += 1;
                    }
                    resolved.push(j as usize);
                }
                let images = Self::collect_images(sources)?;
                for (z, im) in resolved.into_iter().zip(&images) {
                    if z == self.core.len() {
                        self.insert_images(z, std::slice::from_ref(im))?;
                    } else {
                        self.write_at(z, im)?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Insert sources so the first becomes slice `index` (negative counts
    /// from the end; `index == len` appends).
    pub fn insert(&mut self, index: isize, sources: Vec<ImageSource>) -> Result<()> {
        self.check_writable()?;
        let len = self.core.len();
        let n = len as isize;
        let j = if index < 0 { index + n } else { index };
        if j < 0 || j > n {
            return Err(Error::Index { index, len });
        }
        let images = Self::collect_images(sources)?;
        self.insert_images(j as usize, &images)
    }

    /// Append one source at the end.
    pub fn append(&mut self, source: ImageSource) -> Result<()> {
        self.extend(vec![source])
    }

    /// Append sources at the end.
    pub fn extend(&mut self, sources: Vec<ImageSource>) -> Result<()> {
        self.check_writable()?;
        let images = Self::collect_images(sources)?;
        self.insert_images(self.core.len(), &images)
    }

    /// Delete the slices a spec selects. Later slices shift down; the
    /// deletions are applied from the highest index downward so earlier
    /// removals never move slices still to be removed.
    pub fn delete(&mut self, spec: &IndexSpec) -> Result<()> {
        self.check_writable()?;
        let ranges = Self::normalize_deletions(spec, self.core.len())?;
        self.delete_ranges(&ranges)
    }

    /// Remove the last `count` slices.
    pub fn shorten(&mut self, count: usize) -> Result<()> {
        self.check_writable()?;
        let len = self.core.len();
        if count > len {
            return Err(Error::validation(format!(
                "cannot remove {count} slices from a stack of {len}"
            )));
        }
        if count == 0 {
            return Ok(());
        }
        self.delete_ranges(&[(len - count, len)])
    }

    /// Remove every slice.
    pub fn clear(&mut self) -> Result<()> {
        self.check_writable()?;
        let len = self.core.len();
        if len == 0 {
            return Ok(());
        }
        self.delete_ranges(&[(0, len)])
    }

    /// Turn a spec into disjoint half-open ranges ordered highest first.
    /// Duplicate indices collapse.
    fn normalize_deletions(spec: &IndexSpec, len: usize) -> Result<Vec<(usize, usize)>> {
        let mut idxs = spec.indices(len)?;
        idxs.sort_unstable_by(|a, b| b.cmp(a));
        idxs.dedup();
        let mut ranges: Vec<(usize, usize)> = Vec::new();
        for z in idxs {
            match ranges.last_mut() {
                Some((start, _)) if *start == z + 1 => *start = z,
                _ => ranges.push((z, z + 1)),
            }
        }
        Ok(ranges)
    }

    fn delete_ranges(&mut self, ranges: &[(usize, usize)]) -> Result<()> {
        for &(start, stop) in ranges {
            debug!("deleting slices {start}..{stop}");
            self.backend.delete_range(start, stop)?;
            self.core.after_delete(start, stop);
            self.header.update_depth(self.core.len());
        }
        Ok(())
    }
}

impl ImageStack for FileImageStack {
    fn core(&self) -> &StackCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StackCore {
        &mut self.core
    }

    fn resolve_props(&mut self, z: usize) -> Result<SliceProps> {
        self.backend.slice_props(z)
    }

    fn load_slice(&mut self, z: usize) -> Result<Arc<Image>> {
        self.backend.read_slice(z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SliceProps;
    use ndarray::Array2;
    use std::collections::BTreeMap;

    use crate::stack::header::NameRule;

    /// Backend over a plain vector, for exercising the wrapper logic.
    struct VecBackend {
        slices: Vec<Arc<Image>>,
        saved_headers: usize,
    }

    impl VecBackend {
        fn with_values(values: &[u8]) -> VecBackend {
            VecBackend {
                slices: values
                    .iter()
                    .map(|&v| Arc::new(Image::from(Array2::<u8>::from_elem((2, 2), v))))
                    .collect(),
                saved_headers: 0,
            }
        }
    }

    impl StackBackend for VecBackend {
        fn slice_props(&mut self, z: usize) -> Result<SliceProps> {
            Ok(SliceProps::of(&self.slices[z]))
        }

        fn read_slice(&mut self, z: usize) -> Result<Arc<Image>> {
            Ok(Arc::clone(&self.slices[z]))
        }

        fn write_slice(&mut self, z: usize, im: &Image) -> Result<SliceProps> {
            self.slices[z] = Arc::new(im.clone());
            Ok(SliceProps::of(im))
        }

        fn insert_slice(&mut self, z: usize, im: &Image) -> Result<SliceProps> {
            self.slices.insert(z, Arc::new(im.clone()));
            Ok(SliceProps::of(im))
        }

        fn delete_range(&mut self, start: usize, stop: usize) -> Result<()> {
            self.slices.drain(start..stop);
            Ok(())
        }

        fn save_header(&mut self, _header: &Header) -> Result<()> {
            self.saved_headers += 1;
            Ok(())
        }
    }

    fn stack_of(values: &[u8]) -> FileImageStack {
        let backend = VecBackend::with_values(values);
        let header = Header::new(BTreeMap::new(), NameRule::Any);
        FileImageStack::new(Box::new(backend), header, values.len(), false)
    }

    fn gray(v: u8) -> ImageSource {
        ImageSource::from_image(Image::from(Array2::<u8>::from_elem((2, 2), v))).unwrap()
    }

    fn value_at(stack: &mut FileImageStack, z: usize) -> u8 {
        match &*stack.read_slice(z).unwrap() {
            Image::U8(a) => a[[0, 0]],
            _ => panic!("expected u8"),
        }
    }

    fn values(stack: &mut FileImageStack) -> Vec<u8> {
        (0..stack.len()).map(|z| value_at(stack, z)).collect()
    }

    #[test]
    fn test_set_single_index_and_append() {
        let mut stack = stack_of(&[0, 1, 2]);
        stack.set(&IndexSpec::At(1), vec![gray(9)]).unwrap();
        assert_eq!(values(&mut stack), vec![0, 9, 2]);

        // index == depth appends
        stack.set(&IndexSpec::At(3), vec![gray(7)]).unwrap();
        assert_eq!(values(&mut stack), vec![0, 9, 2, 7]);

        assert!(stack.set(&IndexSpec::At(9), vec![gray(1)]).is_err());
    }

    #[test]
    fn test_set_unit_range_grows_and_shrinks() {
        // same count: plain overwrite
        let mut stack = stack_of(&[0, 1, 2, 3]);
        stack
            .set(&IndexSpec::from(1..3), vec![gray(8), gray(9)])
            .unwrap();
        assert_eq!(values(&mut stack), vec![0, 8, 9, 3]);

        // fewer images: the leftover window is deleted
        let mut stack = stack_of(&[0, 1, 2, 3]);
        stack.set(&IndexSpec::from(1..3), vec![gray(8)]).unwrap();
        assert_eq!(values(&mut stack), vec![0, 8, 3]);

        // more images: extras inserted after the window
        let mut stack = stack_of(&[0, 1, 2, 3]);
        stack
            .set(&IndexSpec::from(1..2), vec![gray(8), gray(9)])
            .unwrap();
        assert_eq!(values(&mut stack), vec![0, 8, 9, 2, 3]);
    }

    #[test]
    fn test_set_reverse_unit_range() {
        // step -1 writes the window backward
        let mut stack = stack_of(&[0, 1, 2, 3]);
        let spec = IndexSpec::Range {
            start: Some(2),
            stop: Some(0),
            step: -1,
        };
        stack.set(&spec, vec![gray(8), gray(9)]).unwrap();
        assert_eq!(values(&mut stack), vec![0, 9, 8, 3]);

        // extras are inserted in stack order at the low end of the window
        let mut stack = stack_of(&[0, 1, 2, 3]);
        let spec = IndexSpec::Range {
            start: Some(2),
            stop: Some(1),
            step: -1,
        };
        stack.set(&spec, vec![gray(8), gray(9), gray(7)]).unwrap();
        assert_eq!(values(&mut stack), vec![0, 1, 7, 9, 8, 3]);
    }

    #[test]
    fn test_set_empty_range_inserts_in_place() {
        let mut stack = stack_of(&[0, 1, 2, 3]);
        stack.set(&IndexSpec::from(2..2), vec![gray(9)]).unwrap();
        assert_eq!(values(&mut stack), vec![0, 1, 9, 2, 3]);

        // an empty window with no images is a no-op
        stack.set(&IndexSpec::from(0..0), vec![]).unwrap();
        assert_eq!(values(&mut stack), vec![0, 1, 9, 2, 3]);
    }

    #[test]
    fn test_set_strided_range_exact_only() {
        let mut stack = stack_of(&[0, 1, 2, 3, 4]);
        let spec = IndexSpec::Range {
            start: Some(0),
            stop: None,
            step: 2,
        };
        assert!(stack.set(&spec, vec![gray(9)]).is_err());
        stack
            .set(&spec, vec![gray(7), gray(8), gray(9)])
            .unwrap();
        assert_eq!(values(&mut stack), vec![7, 1, 8, 3, 9]);
    }

    #[test]
    fn test_set_list_with_running_append() {
        let mut stack = stack_of(&[0, 1]);
        // 2 appends, then 3 is valid because the depth grew
        stack
            .set(
                &IndexSpec::List(vec![2, 0, 3]),
                vec![gray(7), gray(8), gray(9)],
            )
            .unwrap();
        assert_eq!(values(&mut stack), vec![8, 1, 7, 9]);

        // 4 would be past even the grown depth
        assert!(stack
            .set(&IndexSpec::List(vec![9]), vec![gray(1)])
            .is_err());
    }

    #[test]
    fn test_delete_descending_ranges() {
        let mut stack = stack_of(&[0, 1, 2, 3, 4, 5]);
        // scattered indices, with a duplicate, as one call
        stack
            .delete(&IndexSpec::List(vec![1, 4, 2, 4]))
            .unwrap();
        assert_eq!(values(&mut stack), vec![0, 3, 5]);

        let mut stack = stack_of(&[0, 1, 2, 3, 4]);
        stack.delete(&IndexSpec::from(1..3)).unwrap();
        assert_eq!(values(&mut stack), vec![0, 3, 4]);
    }

    #[test]
    fn test_shorten_and_clear() {
        let mut stack = stack_of(&[0, 1, 2, 3]);
        stack.shorten(2).unwrap();
        assert_eq!(values(&mut stack), vec![0, 1]);
        assert!(stack.shorten(5).is_err());

        stack.clear().unwrap();
        assert!(stack.is_empty());
    }

    #[test]
    fn test_insert_middle() {
        let mut stack = stack_of(&[0, 3]);
        stack.insert(1, vec![gray(1), gray(2)]).unwrap();
        assert_eq!(values(&mut stack), vec![0, 1, 2, 3]);

        stack.insert(-1, vec![gray(9)]).unwrap();
        assert_eq!(values(&mut stack), vec![0, 1, 2, 9, 3]);
    }

    #[test]
    fn test_readonly_rejects_mutation() {
        let backend = VecBackend::with_values(&[0, 1]);
        let header = Header::new(BTreeMap::new(), NameRule::Any);
        let mut stack = FileImageStack::new(Box::new(backend), header, 2, true);

        assert!(matches!(stack.append(gray(1)), Err(Error::ReadOnly)));
        assert!(matches!(
            stack.delete(&IndexSpec::At(0)),
            Err(Error::ReadOnly)
        ));
        assert!(matches!(stack.save(), Err(Error::ReadOnly)));
        // reading still works
        assert_eq!(value_at(&mut stack, 1), 1);
    }

    #[test]
    fn test_bad_source_fails_before_any_write() {
        use crate::source::SliceResolver;

        struct FailingResolver;
        impl SliceResolver for FailingResolver {
            fn resolve_props(&mut self) -> Result<SliceProps> {
                Err(Error::validation("broken"))
            }
            fn load(&mut self) -> Result<Arc<Image>> {
                Err(Error::validation("broken"))
            }
        }

        let mut stack = stack_of(&[0, 1]);
        let bad = ImageSource::deferred(Box::new(FailingResolver));
        let err = stack.set(&IndexSpec::from(0..2), vec![gray(9), bad]);
        assert!(err.is_err());
        // nothing was written
        assert_eq!(values(&mut stack), vec![0, 1]);
    }

    #[test]
    fn test_cached_slices_survive_and_rekey() {
        let mut stack = stack_of(&[0, 1, 2, 3]);
        stack.set_cache_size(-1).unwrap();
        let _ = stack.read_slice(3).unwrap();
        assert_eq!(stack.core().resident_count(), 1);

        stack.delete(&IndexSpec::At(1)).unwrap();
        // the cached slice moved from index 3 to 2
        assert_eq!(value_at(&mut stack, 2), 3);
        assert_eq!(stack.core().resident_count(), 1);
    }
}
