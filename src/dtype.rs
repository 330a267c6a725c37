//! Element-type and shape model.
//!
//! An [`ElementType`] describes the per-pixel storage of an image: the base
//! kind (signed/unsigned integer, float, bool), byte width, channel count and
//! byte order. Two images are *congruent* when their element types and channel
//! counts match; congruence is what stacks check before accepting a slice.

use std::fmt;

use crate::error::{Error, Result};

/// Largest channel count accepted for a single image.
///
/// Bounded by what the downstream 2D codecs can represent (gray, gray+alpha,
/// RGB, RGBA).
pub const MAX_CHANNELS: usize = 4;

/// Base kind of a pixel element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    /// Two's-complement signed integer
    SignedInt,
    /// Unsigned integer
    UnsignedInt,
    /// IEEE-754 float
    Float,
    /// Boolean (stored as one byte)
    Bool,
}

impl DataKind {
    /// Single-letter prefix used in type descriptions (`i`, `u`, `f`, `b`).
    fn prefix(self) -> char {
        match self {
            DataKind::SignedInt => 'i',
            DataKind::UnsignedInt => 'u',
            DataKind::Float => 'f',
            DataKind::Bool => 'b',
        }
    }
}

/// Byte order of the on-disk representation.
///
/// In-memory arrays are always native order; format adapters record the
/// source order here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ByteOrder {
    /// Little-endian
    Little,
    /// Big-endian
    Big,
    /// Whatever the host uses
    #[default]
    Native,
}

/// Canonical description of a per-pixel element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementType {
    /// Base kind of each channel value
    pub kind: DataKind,
    /// Width of one channel value in bytes (1, 2, 4 or 8)
    pub bytes: u8,
    /// Number of channels per pixel (>= 1)
    pub channels: u8,
    /// Byte order of the source representation
    pub byte_order: ByteOrder,
}

impl ElementType {
    /// Create a single-channel element type, validating the byte width.
    pub fn new(kind: DataKind, bytes: u8) -> Result<Self> {
        match (kind, bytes) {
            (DataKind::Bool, 1) => {}
            (DataKind::Bool, _) => {
                return Err(Error::validation("bool elements are always one byte"));
            }
            (DataKind::Float, 4 | 8) => {}
            (DataKind::Float, _) => {
                return Err(Error::validation(format!(
                    "unsupported float width: {bytes} bytes"
                )));
            }
            (_, 1 | 2 | 4 | 8) => {}
            (_, _) => {
                return Err(Error::validation(format!(
                    "unsupported integer width: {bytes} bytes"
                )));
            }
        }
        Ok(ElementType {
            kind,
            bytes,
            channels: 1,
            byte_order: ByteOrder::Native,
        })
    }

    /// Same element type with a different channel count.
    pub fn with_channels(mut self, channels: u8) -> Result<Self> {
        if channels == 0 {
            return Err(Error::validation("channel count must be at least 1"));
        }
        self.channels = channels;
        Ok(self)
    }

    /// Same element type with an explicit byte order.
    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    /// Whether this is a signed or unsigned integer type.
    pub fn is_integer(&self) -> bool {
        matches!(self.kind, DataKind::SignedInt | DataKind::UnsignedInt)
    }

    /// Element type of a single channel (channels reset to 1).
    pub fn scalar(&self) -> ElementType {
        ElementType {
            channels: 1,
            ..*self
        }
    }

    /// Congruence: element type and channel count match. Byte order is an
    /// on-disk property and does not affect congruence.
    pub fn congruent(&self, other: &ElementType) -> bool {
        self.kind == other.kind && self.bytes == other.bytes && self.channels == other.channels
    }

    /// Smallest representable value for integer types.
    pub fn int_min(&self) -> Option<i128> {
        match self.kind {
            DataKind::UnsignedInt => Some(0),
            DataKind::SignedInt => Some(-(1i128 << (self.bytes as u32 * 8 - 1))),
            _ => None,
        }
    }

    /// Largest representable value for integer types.
    pub fn int_max(&self) -> Option<i128> {
        match self.kind {
            DataKind::UnsignedInt => Some((1i128 << (self.bytes as u32 * 8)) - 1),
            DataKind::SignedInt => Some((1i128 << (self.bytes as u32 * 8 - 1)) - 1),
            _ => None,
        }
    }

    /// Whether `min..=max` is representable without clipping.
    pub fn covers(&self, min: i128, max: i128) -> bool {
        match (self.int_min(), self.int_max()) {
            (Some(lo), Some(hi)) => lo <= min && max <= hi,
            _ => false,
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DataKind::Bool => write!(f, "bool")?,
            kind => write!(f, "{}{}", kind.prefix(), self.bytes as u32 * 8)?,
        }
        if self.channels > 1 {
            write!(f, "x{}", self.channels)?;
        }
        match self.byte_order {
            ByteOrder::Little => write!(f, " (le)"),
            ByteOrder::Big => write!(f, " (be)"),
            ByteOrder::Native => Ok(()),
        }
    }
}

/// Validate that an array shape denotes a legal 2D image: two spatial
/// dimensions plus an optional trailing channel dimension within
/// [`MAX_CHANNELS`]. Returns `(height, width, channels)`.
pub fn check_image_shape(shape: &[usize]) -> Result<(usize, usize, usize)> {
    match shape {
        [h, w] => Ok((*h, *w, 1)),
        [h, w, c] if (1..=MAX_CHANNELS).contains(c) => Ok((*h, *w, *c)),
        [_, _, c] => Err(Error::validation(format!(
            "channel count {c} outside supported range 1-{MAX_CHANNELS}"
        ))),
        _ => Err(Error::validation(format!(
            "expected a 2D image array, got {} dimensions",
            shape.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_bad_widths() {
        assert!(ElementType::new(DataKind::UnsignedInt, 3).is_err());
        assert!(ElementType::new(DataKind::Float, 2).is_err());
        assert!(ElementType::new(DataKind::Bool, 2).is_err());
        assert!(ElementType::new(DataKind::SignedInt, 8).is_ok());
    }

    #[test]
    fn test_int_ranges() {
        let u8t = ElementType::new(DataKind::UnsignedInt, 1).unwrap();
        assert_eq!(u8t.int_min(), Some(0));
        assert_eq!(u8t.int_max(), Some(255));

        let i16t = ElementType::new(DataKind::SignedInt, 2).unwrap();
        assert_eq!(i16t.int_min(), Some(-32768));
        assert_eq!(i16t.int_max(), Some(32767));

        let u64t = ElementType::new(DataKind::UnsignedInt, 8).unwrap();
        assert_eq!(u64t.int_max(), Some(u64::MAX as i128));

        let f32t = ElementType::new(DataKind::Float, 4).unwrap();
        assert_eq!(f32t.int_max(), None);
    }

    #[test]
    fn test_covers() {
        let i8t = ElementType::new(DataKind::SignedInt, 1).unwrap();
        assert!(i8t.covers(-128, 127));
        assert!(!i8t.covers(-129, 0));
        assert!(!i8t.covers(0, 128));
    }

    #[test]
    fn test_congruence_ignores_byte_order() {
        let a = ElementType::new(DataKind::UnsignedInt, 2).unwrap();
        let b = a.with_byte_order(ByteOrder::Big);
        assert!(a.congruent(&b));
        assert_ne!(a, b);

        let c = a.with_channels(3).unwrap();
        assert!(!a.congruent(&c));
    }

    #[test]
    fn test_display() {
        let t = ElementType::new(DataKind::UnsignedInt, 2).unwrap();
        assert_eq!(t.to_string(), "u16");
        let t = t.with_channels(3).unwrap();
        assert_eq!(t.to_string(), "u16x3");
        let t = ElementType::new(DataKind::Bool, 1).unwrap();
        assert_eq!(t.to_string(), "bool");
    }

    #[test]
    fn test_check_image_shape() {
        assert_eq!(check_image_shape(&[4, 6]).unwrap(), (4, 6, 1));
        assert_eq!(check_image_shape(&[4, 6, 3]).unwrap(), (4, 6, 3));
        assert!(check_image_shape(&[4, 6, 5]).is_err());
        assert!(check_image_shape(&[4]).is_err());
        assert!(check_image_shape(&[2, 2, 2, 2]).is_err());
    }
}
