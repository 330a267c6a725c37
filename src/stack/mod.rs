//! Stacks of 2D slices addressed by z index.
//!
//! The [`ImageStack`] trait is the read surface shared by every stack type:
//! in-memory stacks over a volume or a slice collection, file-backed stacks
//! and the lazy filter stacks layered on top of them. Implementors supply
//! slice loading and property resolution; indexing, caching and homogeneity
//! tracking are provided here on top of [`core::StackCore`].

pub mod core;
pub mod file;
pub mod header;
pub mod registry;

use std::sync::Arc;

use crate::dtype::ElementType;
use crate::error::{Error, Result};
use crate::image::{stack_images, Image};
use crate::source::{ImageSource, SliceProps};

use self::core::{SliceState, StackCore, Tracked};

/// Selection of slice indices, with negative-from-the-end and strided range
/// semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexSpec {
    /// A single index.
    At(isize),
    /// A strided range; `None` bounds default by the sign of `step`.
    Range {
        start: Option<isize>,
        stop: Option<isize>,
        step: isize,
    },
    /// An explicit index list, applied in order.
    List(Vec<isize>),
}

impl IndexSpec {
    /// The full range, every slice in order.
    pub fn all() -> IndexSpec {
        IndexSpec::Range {
            start: None,
            stop: None,
            step: 1,
        }
    }

    /// Normalize one index against `len`. Negative indices count from the
    /// end; anything still out of `0..len` is an error.
    pub(crate) fn normalize(index: isize, len: usize) -> Result<usize> {
        let n = len as isize;
        let i = if index < 0 { index + n } else { index };
        if i < 0 || i >= n {
            return Err(Error::Index { index, len });
        }
        Ok(i as usize)
    }

    /// Clamp a range bound the way a strided range needs it: negatives are
    /// offset by `len` first, then the result is clamped to the traversable
    /// window for the step direction.
    fn clamp_bound(v: isize, len: isize, backward: bool) -> isize {
        let v = if v < 0 { v + len } else { v };
        if backward {
            v.clamp(-1, len - 1)
        } else {
            v.clamp(0, len)
        }
    }

    /// Ascending half-open window a unit-step range resolves to; `None` for
    /// anything else. Backward ranges report the window they traverse.
    pub(crate) fn unit_window(&self, len: usize) -> Option<(usize, usize)> {
        let IndexSpec::Range { start, stop, step } = self else {
            return None;
        };
        let n = len as isize;
        match step {
            1 => {
                let lo = start.map_or(0, |s| Self::clamp_bound(s, n, false));
                let hi = stop.map_or(n, |s| Self::clamp_bound(s, n, false)).max(lo);
                Some((lo as usize, hi as usize))
            }
            -1 => {
                // traverses start, start-1, ..., stop+1
                let hi = start.map_or(n - 1, |s| Self::clamp_bound(s, n, true)) + 1;
                let lo = (stop.map_or(-1, |s| Self::clamp_bound(s, n, true)) + 1).min(hi);
                Some((lo as usize, hi as usize))
            }
            _ => None,
        }
    }

    /// Resolve to concrete indices against a stack of length `len`.
    ///
    /// Ranges clamp to the valid window and may be empty; single and listed
    /// indices must land in bounds.
    pub fn indices(&self, len: usize) -> Result<Vec<usize>> {
        match self {
            IndexSpec::At(i) => Ok(vec![Self::normalize(*i, len)?]),
            IndexSpec::Range { start, stop, step } => {
                let step = *step;
                if step == 0 {
                    return Err(Error::validation("range step cannot be zero"));
                }
                let n = len as isize;
                let backward = step < 0;
                let start = match start {
                    Some(s) => Self::clamp_bound(*s, n, backward),
                    None if backward => n - 1,
                    None => 0,
                };
                let stop = match stop {
                    Some(s) => Self::clamp_bound(*s, n, backward),
                    None if backward => -1,
                    None => n,
                };
                let mut out = Vec::new();
                let mut z = start;
                while if backward { z > stop } else { z < stop } {
                    out.push(z as usize);
                    z += step;
                }
                Ok(out)
            }
            IndexSpec::List(list) => list
                .iter()
                .map(|&i| Self::normalize(i, len))
                .collect(),
        }
    }
}

impl From<isize> for IndexSpec {
    fn from(i: isize) -> IndexSpec {
        IndexSpec::At(i)
    }
}

impl From<std::ops::Range<isize>> for IndexSpec {
    fn from(r: std::ops::Range<isize>) -> IndexSpec {
        IndexSpec::Range {
            start: Some(r.start),
            stop: Some(r.end),
            step: 1,
        }
    }
}

impl From<std::ops::RangeFull> for IndexSpec {
    fn from(_: std::ops::RangeFull) -> IndexSpec {
        IndexSpec::all()
    }
}

impl From<Vec<isize>> for IndexSpec {
    fn from(v: Vec<isize>) -> IndexSpec {
        IndexSpec::List(v)
    }
}

/// Read surface of a z-indexed stack of 2D slices.
///
/// Implementors provide storage access through [`core`](ImageStack::core),
/// [`resolve_props`](ImageStack::resolve_props) and
/// [`load_slice`](ImageStack::load_slice); everything else is layered on top
/// and shared by all stack types.
pub trait ImageStack {
    fn core(&self) -> &StackCore;
    fn core_mut(&mut self) -> &mut StackCore;

    /// Determine the properties of slice `z` without loading its pixels,
    /// where the backing store allows it. Falls back to a full load
    /// otherwise. `z` is already in bounds.
    fn resolve_props(&mut self, z: usize) -> Result<SliceProps>;

    /// Load the pixel data of slice `z` from the backing store. `z` is
    /// already in bounds.
    fn load_slice(&mut self, z: usize) -> Result<Arc<Image>>;

    fn len(&self) -> usize {
        self.core().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Properties of slice `z`, memoized after the first resolution.
    fn slice_props(&mut self, z: usize) -> Result<SliceProps> {
        if z >= self.len() {
            return Err(Error::Index {
                index: z as isize,
                len: self.len(),
            });
        }
        if let Some(p) = self.core().props(z) {
            return Ok(p);
        }
        let p = self.resolve_props(z)?;
        self.core_mut().set_props(z, p);
        Ok(p)
    }

    /// Read slice `z`, serving from the cache when resident and recording
    /// the access for LRU purposes either way.
    fn read_slice(&mut self, z: usize) -> Result<Arc<Image>> {
        if z >= self.len() {
            return Err(Error::Index {
                index: z as isize,
                len: self.len(),
            });
        }
        if self.core_mut().touch(z) {
            if let Some(im) = self.core().resident(z) {
                return Ok(im);
            }
        }
        let im = self.load_slice(z)?;
        self.core_mut().set_props(z, SliceProps::of(&im));
        self.core_mut().store(z, Arc::clone(&im));
        Ok(im)
    }

    /// Read one slice by possibly-negative index.
    fn slice(&mut self, index: isize) -> Result<Arc<Image>> {
        let z = IndexSpec::normalize(index, self.len())?;
        self.read_slice(z)
    }

    /// Read every slice a spec selects, in selection order.
    fn read(&mut self, spec: &IndexSpec) -> Result<Vec<Arc<Image>>> {
        spec.indices(self.len())?
            .into_iter()
            .map(|z| self.read_slice(z))
            .collect()
    }

    /// Recompute any homogeneity axis currently unknown by scanning slice
    /// properties. Known values, uniform or mixed, are left alone; writes
    /// and inserts keep those accurate incrementally.
    fn refresh_homogeneity(&mut self) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let need_shape = self.core().shape == Tracked::Unknown;
        let need_dtype = self.core().element_type == Tracked::Unknown;
        if !need_shape && !need_dtype {
            return Ok(());
        }
        let first = self.slice_props(0)?;
        let mut shape = Tracked::Uniform(first.shape);
        let mut dtype = Tracked::Uniform(first.element_type);
        for z in 1..self.len() {
            let p = self.slice_props(z)?;
            if let Tracked::Uniform(s) = shape {
                if s != p.shape {
                    shape = Tracked::Mixed;
                }
            }
            if let Tracked::Uniform(et) = dtype {
                if !et.congruent(&p.element_type) {
                    dtype = Tracked::Mixed;
                }
            }
            if shape == Tracked::Mixed && dtype == Tracked::Mixed {
                break;
            }
        }
        if need_shape {
            self.core_mut().shape = shape;
        }
        if need_dtype {
            self.core_mut().element_type = dtype;
        }
        Ok(())
    }

    /// Whether every slice has the same (height, width). Empty stacks are
    /// vacuously homogeneous.
    fn is_shape_homogeneous(&mut self) -> Result<bool> {
        if self.is_empty() {
            return Ok(true);
        }
        self.refresh_homogeneity()?;
        Ok(matches!(self.core().shape, Tracked::Uniform(_)))
    }

    /// Whether every slice has the same element type (byte order ignored).
    fn is_dtype_homogeneous(&mut self) -> Result<bool> {
        if self.is_empty() {
            return Ok(true);
        }
        self.refresh_homogeneity()?;
        Ok(matches!(self.core().element_type, Tracked::Uniform(_)))
    }

    /// The single (height, width) shared by all slices; errors if shapes
    /// vary or the stack is empty.
    fn uniform_shape(&mut self) -> Result<(usize, usize)> {
        if self.is_empty() {
            return Err(Error::validation("empty stack has no uniform shape"));
        }
        self.refresh_homogeneity()?;
        match self.core().shape {
            Tracked::Uniform(s) => Ok(s),
            _ => Err(Error::validation("stack slices have differing shapes")),
        }
    }

    /// The single element type shared by all slices; errors if types vary
    /// or the stack is empty.
    fn uniform_element_type(&mut self) -> Result<ElementType> {
        if self.is_empty() {
            return Err(Error::validation("empty stack has no uniform dtype"));
        }
        self.refresh_homogeneity()?;
        match self.core().element_type {
            Tracked::Uniform(et) => Ok(et),
            _ => Err(Error::validation("stack slices have differing dtypes")),
        }
    }

    fn cache_size(&self) -> isize {
        self.core().cache_size()
    }

    /// Set the slice cache bound: 0 disables caching, -1 makes it unbounded,
    /// N > 0 keeps at most N slices resident.
    fn set_cache_size(&mut self, size: isize) -> Result<()> {
        self.core_mut().set_cache_size(size)
    }

    /// Load every slice and stack them into one (depth, height, width[, c])
    /// volume. Requires shape and dtype homogeneity.
    fn to_volume(&mut self) -> Result<Image> {
        self.uniform_shape()?;
        self.uniform_element_type()?;
        let slices = self.read(&IndexSpec::all())?;
        stack_images(&slices)
    }
}

/// Read-only stack over a single in-memory volume; slice `z` is plane `z`
/// of the array.
pub struct ArrayStack {
    core: StackCore,
    volume: Image,
}

impl ArrayStack {
    /// Wrap a (depth, height, width) or (depth, height, width, channels)
    /// volume.
    pub fn new(volume: Image) -> Result<ArrayStack> {
        let shape = volume.raw_shape();
        let (depth, hw, channels) = match *shape {
            [d, h, w] => (d, (h, w), 1),
            [d, h, w, c] if (1..=crate::dtype::MAX_CHANNELS).contains(&c) => (d, (h, w), c),
            _ => {
                return Err(Error::validation(format!(
                    "expected a 3D or 4D volume, got shape {shape:?}"
                )));
            }
        };
        let et = volume.scalar_type().with_channels(channels as u8)?;
        let props = SliceProps {
            element_type: et,
            shape: hw,
        };
        let mut core = StackCore::new(
            (0..depth).map(|_| SliceState::with_props(props)).collect(),
        );
        core.shape = Tracked::Uniform(props.shape);
        core.element_type = Tracked::Uniform(et);
        Ok(ArrayStack { core, volume })
    }

    pub fn volume(&self) -> &Image {
        &self.volume
    }
}

impl ImageStack for ArrayStack {
    fn core(&self) -> &StackCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StackCore {
        &mut self.core
    }

    fn resolve_props(&mut self, _z: usize) -> Result<SliceProps> {
        let s = self.volume.raw_shape();
        let channels = if s.len() == 4 { s[3] } else { 1 };
        Ok(SliceProps {
            element_type: self.volume.scalar_type().with_channels(channels as u8)?,
            shape: (s[1], s[2]),
        })
    }

    fn load_slice(&mut self, z: usize) -> Result<Arc<Image>> {
        Ok(Arc::new(self.volume.index_slice(z)))
    }

    // the volume already is in memory, caching copies of it gains nothing
    fn set_cache_size(&mut self, _size: isize) -> Result<()> {
        Ok(())
    }
}

/// Stack over an ordered collection of independent slice sources. Slices
/// may differ in shape and dtype; sources stay deferred until read.
pub struct CollectionStack {
    core: StackCore,
    sources: Vec<ImageSource>,
}

impl CollectionStack {
    pub fn new(sources: Vec<ImageSource>) -> CollectionStack {
        let core = StackCore::with_len(sources.len());
        CollectionStack { core, sources }
    }

    /// Append one more source at the end.
    pub fn push(&mut self, source: ImageSource) {
        let idx = self.sources.len();
        self.sources.push(source);
        self.core.after_insert(idx, vec![SliceState::default()]);
    }
}

impl ImageStack for CollectionStack {
    fn core(&self) -> &StackCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StackCore {
        &mut self.core
    }

    fn resolve_props(&mut self, z: usize) -> Result<SliceProps> {
        self.sources[z].props()
    }

    fn load_slice(&mut self, z: usize) -> Result<Arc<Image>> {
        self.sources[z].data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3};

    #[test]
    fn test_index_spec_ranges() {
        let all = IndexSpec::all();
        assert_eq!(all.indices(4).unwrap(), vec![0, 1, 2, 3]);

        let spec = IndexSpec::Range {
            start: Some(1),
            stop: Some(-1),
            step: 1,
        };
        assert_eq!(spec.indices(5).unwrap(), vec![1, 2, 3]);

        let rev = IndexSpec::Range {
            start: None,
            stop: None,
            step: -2,
        };
        assert_eq!(rev.indices(5).unwrap(), vec![4, 2, 0]);

        // out-of-bounds range bounds clamp instead of failing
        let wide = IndexSpec::Range {
            start: Some(-100),
            stop: Some(100),
            step: 1,
        };
        assert_eq!(wide.indices(3).unwrap(), vec![0, 1, 2]);

        let empty = IndexSpec::Range {
            start: Some(3),
            stop: Some(1),
            step: 1,
        };
        assert!(empty.indices(5).unwrap().is_empty());
    }

    #[test]
    fn test_index_spec_at_and_list() {
        assert_eq!(IndexSpec::At(-1).indices(4).unwrap(), vec![3]);
        assert!(IndexSpec::At(4).indices(4).is_err());
        assert!(IndexSpec::At(-5).indices(4).is_err());

        let list = IndexSpec::List(vec![2, 0, -1]);
        assert_eq!(list.indices(3).unwrap(), vec![2, 0, 2]);
        assert!(IndexSpec::List(vec![0, 9]).indices(3).is_err());
    }

    #[test]
    fn test_array_stack_reads_planes() {
        let mut vol = Array3::<u8>::zeros((3, 2, 2));
        vol[[1, 0, 0]] = 7;
        let mut stack = ArrayStack::new(Image::from(vol)).unwrap();

        assert_eq!(stack.len(), 3);
        assert!(stack.is_shape_homogeneous().unwrap());
        assert!(stack.is_dtype_homogeneous().unwrap());
        assert_eq!(stack.uniform_shape().unwrap(), (2, 2));

        let s1 = stack.slice(1).unwrap();
        match &*s1 {
            Image::U8(a) => assert_eq!(a[[0, 0]], 7),
            other => panic!("unexpected variant {:?}", other.element_type()),
        }

        let last = stack.slice(-1).unwrap();
        assert_eq!(last.shape(), (2, 2));
    }

    #[test]
    fn test_array_stack_rejects_2d() {
        let im = Image::from(Array2::<u8>::zeros((2, 2)));
        assert!(ArrayStack::new(im).is_err());
    }

    #[test]
    fn test_collection_stack_heterogeneous() {
        let a = Image::from(Array2::<u8>::zeros((2, 2)));
        let b = Image::from(Array2::<u16>::zeros((4, 4)));
        let mut stack = CollectionStack::new(vec![
            ImageSource::from_image(a).unwrap(),
            ImageSource::from_image(b).unwrap(),
        ]);

        assert_eq!(stack.len(), 2);
        assert!(!stack.is_shape_homogeneous().unwrap());
        assert!(!stack.is_dtype_homogeneous().unwrap());
        assert!(stack.uniform_shape().is_err());
        assert!(stack.to_volume().is_err());
    }

    #[test]
    fn test_to_volume_round_trip() {
        let mut vol = Array3::<u16>::zeros((2, 3, 3));
        vol[[0, 1, 1]] = 5;
        vol[[1, 2, 0]] = 9;
        let image = Image::from(vol.clone());
        let mut stack = ArrayStack::new(image).unwrap();

        match stack.to_volume().unwrap() {
            Image::U16(a) => {
                assert_eq!(a.shape(), &[2, 3, 3]);
                assert_eq!(a[[0, 1, 1]], 5);
                assert_eq!(a[[1, 2, 0]], 9);
            }
            other => panic!("unexpected variant {:?}", other.element_type()),
        }
    }

    #[test]
    fn test_empty_stack_is_vacuously_homogeneous() {
        let mut stack = CollectionStack::new(Vec::new());
        assert!(stack.is_empty());
        assert!(stack.is_shape_homogeneous().unwrap());
        assert!(stack.is_dtype_homogeneous().unwrap());
        assert!(stack.uniform_shape().is_err());
    }
}
