//! Value numbering and connected-component labeling.
//!
//! The operations here work on one image (2D slice, optionally with
//! channels); [`stacks`] layers them over whole stacks. Labels are always
//! `u64` images with 0 reserved for exact-zero pixels and label values
//! contiguous from 1.

pub(crate) mod algo;
pub mod stacks;
pub(crate) mod unique;

use log::debug;
use ndarray::{ArrayD, IxDyn};

use crate::dtype::{DataKind, ElementType, MAX_CHANNELS};
use crate::error::{Error, Result};
use crate::image::{with_image, with_int_image, Image, PixelZero};

use self::algo::{
    label_components, number_rows, number_values, renumber_rows, renumber_values,
    split_components,
};

/// Spatial dimensions and pixel width (channel count) of a buffer.
/// `volume` picks between the slice layouts (`(h, w)` / `(h, w, c)`) and the
/// volume layouts (`(d, h, w)` / `(d, h, w, c)`), which are ambiguous at
/// three dimensions.
fn layout(im: &Image, volume: bool) -> Result<(Vec<usize>, usize)> {
    let shape = im.raw_shape();
    let spatial_ndim = if volume { 3 } else { 2 };
    match shape.len().checked_sub(spatial_ndim) {
        Some(0) => Ok((shape.to_vec(), 1)),
        Some(1) if (1..=MAX_CHANNELS).contains(&shape[spatial_ndim]) => {
            Ok((shape[..spatial_ndim].to_vec(), shape[spatial_ndim]))
        }
        _ => Err(Error::validation(format!(
            "expected a {}D array with optional channels, got shape {shape:?}",
            spatial_ndim
        ))),
    }
}

fn to_label_image(labels: Vec<u64>, spatial: &[usize]) -> Result<Image> {
    ArrayD::from_shape_vec(IxDyn(spatial), labels)
        .map(Image::U64)
        .map_err(|e| Error::validation(format!("label buffer mismatch: {e}")))
}

fn require_integer(im: &Image) -> Result<()> {
    if im.is_integer() {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "labeling needs integer values, got {}",
            im.scalar_type()
        )))
    }
}

fn number_with(im: &Image, ordered: bool, volume: bool) -> Result<(Image, u64)> {
    require_integer(im)?;
    let (spatial, width) = layout(im, volume)?;
    with_int_image!(im, a => {
        let flat = Image::flat_values(a);
        let (labels, n) = match (width, ordered) {
            (1, true) => number_values(&flat),
            (1, false) => renumber_values(&flat),
            (_, true) => number_rows(&flat, width),
            (_, false) => renumber_rows(&flat, width),
        };
        debug!("numbered {} distinct values", n);
        Ok((to_label_image(labels, &spatial)?, n))
    }, unreachable!("integer kind checked above"))
}

fn label_with(im: &Image, volume: bool) -> Result<(Image, u64)> {
    let (spatial, width) = layout(im, volume)?;
    let foreground: Vec<bool> = with_image!(im, a => {
        let flat = Image::flat_values(a);
        flat.chunks_exact(width)
            .map(|px| px.iter().any(|v| !v.is_zero()))
            .collect()
    });
    let (labels, n) = label_components(&foreground, &spatial);
    debug!("found {} connected components", n);
    Ok((to_label_image(labels, &spatial)?, n))
}

fn relabel_with(im: &Image, volume: bool) -> Result<(Image, u64)> {
    require_integer(im)?;
    let (spatial, width) = layout(im, volume)?;
    let (numbered, n) = with_int_image!(im, a => {
        let flat = Image::flat_values(a);
        if width == 1 {
            renumber_values(&flat)
        } else {
            renumber_rows(&flat, width)
        }
    }, unreachable!("integer kind checked above"));
    let (labels, total) = split_components(&numbered, &spatial, n);
    debug!("relabeled {} values into {} components", n, total);
    Ok((to_label_image(labels, &spatial)?, total))
}

/// Assign consecutive labels to the distinct values of an integer image.
///
/// Exact-zero pixels (all channels zero) always map to 0 and never consume
/// a label; the remaining distinct values get 1..=max. With `ordered` the
/// labels follow the values' sort order, otherwise first appearance in scan
/// order. Returns the `u64` label image and the highest label.
pub fn number(im: &Image, ordered: bool) -> Result<(Image, u64)> {
    number_with(im, ordered, false)
}

/// Label the connected components of the nonzero pixels of an image of any
/// element type, 4-connected, ids 1..=count in scan order of discovery.
pub fn label(im: &Image) -> Result<(Image, u64)> {
    label_with(im, false)
}

/// Renumber an integer image and then split every label into its connected
/// components, so equal values that do not touch get distinct labels. The
/// result is contiguous from 1.
pub fn relabel(im: &Image) -> Result<(Image, u64)> {
    relabel_with(im, false)
}

pub(crate) fn number_volume(im: &Image, ordered: bool) -> Result<(Image, u64)> {
    number_with(im, ordered, true)
}

pub(crate) fn label_volume(im: &Image) -> Result<(Image, u64)> {
    label_with(im, true)
}

pub(crate) fn relabel_volume(im: &Image) -> Result<(Image, u64)> {
    relabel_with(im, true)
}

/// The narrowest integer type of `kind` and width at least `min_bytes` that
/// covers `[mn, mx]`.
fn narrowest(kind: DataKind, min_bytes: u8, mn: i128, mx: i128) -> Result<ElementType> {
    for bytes in [1u8, 2, 4, 8] {
        if bytes < min_bytes {
            continue;
        }
        let et = ElementType::new(kind, bytes)?;
        if et.covers(mn, mx) {
            return Ok(et);
        }
    }
    Err(Error::IncompatibleRange { min: mn, max: mx })
}

/// Re-store an integer image in the narrowest integer type that holds its
/// values, optionally no narrower than `min_type` (which also fixes the
/// signedness). Without `min_type` the image keeps its signedness. An empty
/// image shrinks to the narrowest allowed type.
pub fn shrink_integer(im: &Image, min_type: Option<ElementType>) -> Result<Image> {
    require_integer(im)?;
    let (kind, min_bytes) = match min_type {
        Some(t) => {
            if !t.is_integer() {
                return Err(Error::validation(format!(
                    "minimum type must be an integer type, got {t}"
                )));
            }
            (t.kind, t.bytes)
        }
        None => (im.scalar_type().kind, 1),
    };
    let (mn, mx) = match im.int_min_max()? {
        Some(range) => range,
        None => (0, 0),
    };
    if kind == DataKind::UnsignedInt && mn < 0 {
        return Err(Error::IncompatibleRange { min: mn, max: mx });
    }
    let target = narrowest(kind, min_bytes, mn, mx)?;
    debug!("shrinking {} to {}", im.scalar_type(), target);
    im.cast_int(target)
}
