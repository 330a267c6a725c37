//! Dynamic pixel buffers.
//!
//! [`Image`] wraps an `ndarray` array of one of the supported element types.
//! Slice-shaped images are `(h, w)` or `(h, w, c)`; stack drivers additionally
//! build volume-shaped buffers `(d, h, w)` / `(d, h, w, c)` through
//! [`stack_images`], which only ever flow through APIs that know the layout.

use std::borrow::Cow;
use std::sync::Arc;

use ndarray::{Array2, Array3, ArrayD, Axis};

use crate::dtype::{DataKind, ElementType, check_image_shape};
use crate::error::{Error, Result};

/// A dynamically typed image array.
#[derive(Debug, Clone, PartialEq)]
pub enum Image {
    /// 8-bit unsigned
    U8(ArrayD<u8>),
    /// 16-bit unsigned
    U16(ArrayD<u16>),
    /// 32-bit unsigned
    U32(ArrayD<u32>),
    /// 64-bit unsigned
    U64(ArrayD<u64>),
    /// 8-bit signed
    I8(ArrayD<i8>),
    /// 16-bit signed
    I16(ArrayD<i16>),
    /// 32-bit signed
    I32(ArrayD<i32>),
    /// 64-bit signed
    I64(ArrayD<i64>),
    /// 32-bit float
    F32(ArrayD<f32>),
    /// 64-bit float
    F64(ArrayD<f64>),
    /// Boolean
    Bool(ArrayD<bool>),
}

/// Dispatch over every variant, binding the inner array.
macro_rules! with_image {
    ($im:expr, $arr:ident => $body:expr) => {
        match $im {
            $crate::image::Image::U8($arr) => $body,
            $crate::image::Image::U16($arr) => $body,
            $crate::image::Image::U32($arr) => $body,
            $crate::image::Image::U64($arr) => $body,
            $crate::image::Image::I8($arr) => $body,
            $crate::image::Image::I16($arr) => $body,
            $crate::image::Image::I32($arr) => $body,
            $crate::image::Image::I64($arr) => $body,
            $crate::image::Image::F32($arr) => $body,
            $crate::image::Image::F64($arr) => $body,
            $crate::image::Image::Bool($arr) => $body,
        }
    };
}

/// Dispatch over every variant, rebuilding the same variant from the body.
macro_rules! map_image {
    ($im:expr, $arr:ident => $body:expr) => {
        match $im {
            $crate::image::Image::U8($arr) => $crate::image::Image::U8($body),
            $crate::image::Image::U16($arr) => $crate::image::Image::U16($body),
            $crate::image::Image::U32($arr) => $crate::image::Image::U32($body),
            $crate::image::Image::U64($arr) => $crate::image::Image::U64($body),
            $crate::image::Image::I8($arr) => $crate::image::Image::I8($body),
            $crate::image::Image::I16($arr) => $crate::image::Image::I16($body),
            $crate::image::Image::I32($arr) => $crate::image::Image::I32($body),
            $crate::image::Image::I64($arr) => $crate::image::Image::I64($body),
            $crate::image::Image::F32($arr) => $crate::image::Image::F32($body),
            $crate::image::Image::F64($arr) => $crate::image::Image::F64($body),
            $crate::image::Image::Bool($arr) => $crate::image::Image::Bool($body),
        }
    };
}

/// Dispatch over the integer variants only; `$other` handles the rest.
macro_rules! with_int_image {
    ($im:expr, $arr:ident => $body:expr, $other:expr) => {
        match $im {
            $crate::image::Image::U8($arr) => $body,
            $crate::image::Image::U16($arr) => $body,
            $crate::image::Image::U32($arr) => $body,
            $crate::image::Image::U64($arr) => $body,
            $crate::image::Image::I8($arr) => $body,
            $crate::image::Image::I16($arr) => $body,
            $crate::image::Image::I32($arr) => $body,
            $crate::image::Image::I64($arr) => $body,
            _ => $other,
        }
    };
}

pub(crate) use {with_image, with_int_image};

/// Per-pixel zero test, used for background/foreground decisions.
pub(crate) trait PixelZero: Copy {
    fn is_zero(&self) -> bool;
}

macro_rules! impl_pixel_zero_int {
    ($($t:ty),*) => { $(
        impl PixelZero for $t {
            fn is_zero(&self) -> bool { *self == 0 }
        }
    )* };
}
impl_pixel_zero_int!(u8, u16, u32, u64, i8, i16, i32, i64);

impl PixelZero for f32 {
    fn is_zero(&self) -> bool {
        *self == 0.0
    }
}
impl PixelZero for f64 {
    fn is_zero(&self) -> bool {
        *self == 0.0
    }
}
impl PixelZero for bool {
    fn is_zero(&self) -> bool {
        !*self
    }
}

/// Lossless round trip through `i128` for the integer pixel types.
///
/// `from_i128` is only called with values already checked against the target
/// type's representable range.
pub(crate) trait IntPixel: Copy {
    fn to_i128(self) -> i128;
    fn from_i128(v: i128) -> Self;
}

macro_rules! impl_int_pixel {
    ($($t:ty),*) => { $(
        impl IntPixel for $t {
            fn to_i128(self) -> i128 { self as i128 }
            fn from_i128(v: i128) -> Self { v as $t }
        }
    )* };
}
impl_int_pixel!(u8, u16, u32, u64, i8, i16, i32, i64);

macro_rules! impl_image_from {
    ($($var:ident: $t:ty),*) => { $(
        impl From<Array2<$t>> for Image {
            fn from(a: Array2<$t>) -> Self { Image::$var(a.into_dyn()) }
        }
        impl From<Array3<$t>> for Image {
            fn from(a: Array3<$t>) -> Self { Image::$var(a.into_dyn()) }
        }
        impl From<ArrayD<$t>> for Image {
            fn from(a: ArrayD<$t>) -> Self { Image::$var(a) }
        }
    )* };
}
impl_image_from!(
    U8: u8, U16: u16, U32: u32, U64: u64,
    I8: i8, I16: i16, I32: i32, I64: i64,
    F32: f32, F64: f64, Bool: bool
);

impl Image {
    /// Raw array shape.
    pub fn raw_shape(&self) -> &[usize] {
        with_image!(self, a => a.shape())
    }

    /// Number of array dimensions.
    pub fn ndim(&self) -> usize {
        with_image!(self, a => a.ndim())
    }

    /// Total element count (all channels).
    pub fn len(&self) -> usize {
        with_image!(self, a => a.len())
    }

    /// Whether the array holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spatial shape `(height, width)` of a slice-shaped image.
    pub fn shape(&self) -> (usize, usize) {
        let s = self.raw_shape();
        (s[0], s[1])
    }

    /// Channel count of a slice-shaped image.
    pub fn channels(&self) -> usize {
        let s = self.raw_shape();
        if s.len() == 3 { s[2] } else { 1 }
    }

    /// Element type of one channel value, ignoring the channel count.
    pub fn scalar_type(&self) -> ElementType {
        let (kind, bytes) = match self {
            Image::U8(_) => (DataKind::UnsignedInt, 1),
            Image::U16(_) => (DataKind::UnsignedInt, 2),
            Image::U32(_) => (DataKind::UnsignedInt, 4),
            Image::U64(_) => (DataKind::UnsignedInt, 8),
            Image::I8(_) => (DataKind::SignedInt, 1),
            Image::I16(_) => (DataKind::SignedInt, 2),
            Image::I32(_) => (DataKind::SignedInt, 4),
            Image::I64(_) => (DataKind::SignedInt, 8),
            Image::F32(_) => (DataKind::Float, 4),
            Image::F64(_) => (DataKind::Float, 8),
            Image::Bool(_) => (DataKind::Bool, 1),
        };
        ElementType::new(kind, bytes).expect("supported widths by construction")
    }

    /// Element type of a slice-shaped image, including its channel count.
    pub fn element_type(&self) -> ElementType {
        self.scalar_type()
            .with_channels(self.channels() as u8)
            .expect("channel count >= 1 by construction")
    }

    /// Congruence check per the data model: element type and channel count.
    pub fn congruent_with(&self, other: &Image) -> bool {
        self.element_type().congruent(&other.element_type())
    }

    /// Whether the element type is a signed or unsigned integer.
    pub fn is_integer(&self) -> bool {
        self.scalar_type().is_integer()
    }

    /// Observed value range of an integer image; `None` for empty arrays.
    pub(crate) fn int_min_max(&self) -> Result<Option<(i128, i128)>> {
        with_int_image!(self, a => {
            let mut it = a.iter();
            Ok(it.next().map(|first| {
                let first = first.to_i128();
                it.fold((first, first), |(mn, mx), v| {
                    let v = v.to_i128();
                    (mn.min(v), mx.max(v))
                })
            }))
        }, Err(Error::validation(format!(
            "expected an integer image, got {}", self.scalar_type()
        ))))
    }

    /// Cast an integer image to another integer element type.
    ///
    /// The caller is responsible for having checked that every value fits the
    /// target range (see `shrink_integer`).
    pub(crate) fn cast_int(&self, target: ElementType) -> Result<Image> {
        fn cast_to<S: IntPixel, T: IntPixel>(a: &ArrayD<S>) -> ArrayD<T> {
            a.mapv(|v| T::from_i128(v.to_i128()))
        }
        with_int_image!(self, a => {
            Ok(match (target.kind, target.bytes) {
                (DataKind::UnsignedInt, 1) => Image::U8(cast_to(a)),
                (DataKind::UnsignedInt, 2) => Image::U16(cast_to(a)),
                (DataKind::UnsignedInt, 4) => Image::U32(cast_to(a)),
                (DataKind::UnsignedInt, 8) => Image::U64(cast_to(a)),
                (DataKind::SignedInt, 1) => Image::I8(cast_to(a)),
                (DataKind::SignedInt, 2) => Image::I16(cast_to(a)),
                (DataKind::SignedInt, 4) => Image::I32(cast_to(a)),
                (DataKind::SignedInt, 8) => Image::I64(cast_to(a)),
                _ => {
                    return Err(Error::validation(format!(
                        "cannot cast integers to {target}"
                    )));
                }
            })
        }, Err(Error::validation(format!(
            "expected an integer image, got {}", self.scalar_type()
        ))))
    }

    /// Values in logical (row-major) order, borrowing when contiguous.
    pub(crate) fn flat_values<T: Copy>(a: &ArrayD<T>) -> Cow<'_, [T]> {
        match a.as_slice() {
            Some(s) => Cow::Borrowed(s),
            None => Cow::Owned(a.iter().copied().collect()),
        }
    }

    /// Extract slice `z` of a volume-shaped image as an owned image.
    pub(crate) fn index_slice(&self, z: usize) -> Image {
        map_image!(self, a => a.index_axis(Axis(0), z).to_owned())
    }
}

/// Validate that an image denotes a legal 2D slice: `(h, w)` or `(h, w, c)`
/// with `c` within bounds. Element kinds are constrained by the `Image` enum
/// itself.
pub fn check_image(im: &Image) -> Result<()> {
    check_image_shape(im.raw_shape()).map(|_| ())
}

/// Assemble congruent, same-shape slices into a volume with a leading depth
/// axis. Fails with a validation error when the inputs disagree in shape or
/// element type, or when `slices` is empty.
pub(crate) fn stack_images(slices: &[Arc<Image>]) -> Result<Image> {
    let first = slices
        .first()
        .ok_or_else(|| Error::validation("cannot build a volume from an empty stack"))?;

    macro_rules! stack_as {
        ($var:ident, $t:ty) => {{
            let mut views = Vec::with_capacity(slices.len());
            for im in slices {
                match im.as_ref() {
                    Image::$var(a) => views.push(a.view()),
                    other => {
                        return Err(Error::validation(format!(
                            "heterogeneous element types in stack: {} vs {}",
                            first.element_type(),
                            other.element_type()
                        )));
                    }
                }
            }
            ndarray::stack(Axis(0), &views)
                .map(Image::$var)
                .map_err(|e| Error::validation(format!("heterogeneous slice shapes: {e}")))
        }};
    }

    match first.as_ref() {
        Image::U8(_) => stack_as!(U8, u8),
        Image::U16(_) => stack_as!(U16, u16),
        Image::U32(_) => stack_as!(U32, u32),
        Image::U64(_) => stack_as!(U64, u64),
        Image::I8(_) => stack_as!(I8, i8),
        Image::I16(_) => stack_as!(I16, i16),
        Image::I32(_) => stack_as!(I32, i32),
        Image::I64(_) => stack_as!(I64, i64),
        Image::F32(_) => stack_as!(F32, f32),
        Image::F64(_) => stack_as!(F64, f64),
        Image::Bool(_) => stack_as!(Bool, bool),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    #[test]
    fn test_element_type_and_shape() {
        let im: Image = array![[0u8, 1], [2, 3]].into();
        assert_eq!(im.shape(), (2, 2));
        assert_eq!(im.channels(), 1);
        assert_eq!(im.element_type().to_string(), "u8");

        let rgb: Image = Array3::<u8>::zeros((2, 3, 3)).into();
        assert_eq!(rgb.shape(), (2, 3));
        assert_eq!(rgb.channels(), 3);
        assert_eq!(rgb.element_type().to_string(), "u8x3");
    }

    #[test]
    fn test_check_image() {
        let ok: Image = Array2::<u16>::zeros((3, 5)).into();
        assert!(check_image(&ok).is_ok());

        let too_many: Image = Array3::<u8>::zeros((2, 2, 7)).into();
        assert!(check_image(&too_many).is_err());

        let volume: Image = ArrayD::<u8>::zeros(ndarray::IxDyn(&[2, 2, 2, 2])).into();
        assert!(check_image(&volume).is_err());
    }

    #[test]
    fn test_congruence() {
        let a: Image = Array2::<u8>::zeros((2, 2)).into();
        let b: Image = Array2::<u8>::zeros((9, 9)).into();
        let c: Image = Array2::<u16>::zeros((2, 2)).into();
        assert!(a.congruent_with(&b));
        assert!(!a.congruent_with(&c));
    }

    #[test]
    fn test_int_min_max() {
        let im: Image = array![[-3i16, 7], [0, 12000]].into();
        assert_eq!(im.int_min_max().unwrap(), Some((-3, 12000)));

        let empty: Image = Array2::<u8>::zeros((0, 0)).into();
        assert_eq!(empty.int_min_max().unwrap(), None);

        let f: Image = Array2::<f32>::zeros((1, 1)).into();
        assert!(f.int_min_max().is_err());
    }

    #[test]
    fn test_cast_int() {
        let im: Image = array![[300u16, 5], [0, 65535]].into();
        let t = ElementType::new(DataKind::UnsignedInt, 4).unwrap();
        let out = im.cast_int(t).unwrap();
        match out {
            Image::U32(a) => assert_eq!(a[[1, 1]], 65535),
            other => panic!("unexpected variant: {:?}", other.element_type()),
        }
    }

    #[test]
    fn test_stack_and_index() {
        let a = Arc::new(Image::from(array![[1u8, 2], [3, 4]]));
        let b = Arc::new(Image::from(array![[5u8, 6], [7, 8]]));
        let vol = stack_images(&[a, b]).unwrap();
        assert_eq!(vol.raw_shape(), &[2, 2, 2]);

        let back = vol.index_slice(1);
        assert_eq!(back, Image::from(array![[5u8, 6], [7, 8]]));
    }

    #[test]
    fn test_stack_rejects_mismatches() {
        let a = Arc::new(Image::from(array![[1u8, 2]]));
        let b = Arc::new(Image::from(array![[1u16, 2]]));
        assert!(stack_images(&[a.clone(), b]).is_err());

        let c = Arc::new(Image::from(array![[1u8, 2], [3, 4]]));
        assert!(stack_images(&[a, c]).is_err());
    }
}
