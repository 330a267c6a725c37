//! Deferred-property image sources.
//!
//! An [`ImageSource`] decouples knowing a slice's shape and element type from
//! materializing its pixel data. Formats that record per-slice metadata in a
//! header hand out sources with the properties already known; formats that
//! would have to inspect the file supply a resolver that is consulted once
//! and memoized.

use std::sync::Arc;

use crate::dtype::ElementType;
use crate::error::Result;
use crate::image::{Image, check_image};

/// Shape and element type of one slice, known without loading pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceProps {
    /// Per-pixel element type, channel count included
    pub element_type: ElementType,
    /// Spatial shape `(height, width)`
    pub shape: (usize, usize),
}

impl SliceProps {
    /// Properties of an already materialized image.
    pub fn of(im: &Image) -> SliceProps {
        SliceProps {
            element_type: im.element_type(),
            shape: im.shape(),
        }
    }
}

/// A resolver backing a deferred source. `resolve_props` must be cheap
/// relative to `load` (e.g. a codec header read); `load` materializes pixels.
pub trait SliceResolver {
    /// Determine shape and element type without decoding pixel data where the
    /// underlying format allows it.
    fn resolve_props(&mut self) -> Result<SliceProps>;

    /// Materialize the pixel data.
    fn load(&mut self) -> Result<Arc<Image>>;
}

enum Inner {
    /// Data held in memory; properties derived directly.
    Memory(Arc<Image>),
    /// Properties resolved on first access, then cached.
    Deferred {
        props: Option<SliceProps>,
        resolver: Box<dyn SliceResolver>,
    },
}

/// A lazy holder of one 2D image.
///
/// Construction always supplies either the data, explicit properties, or a
/// resolver, so the "neither set nor overridden" misuse of the original
/// design cannot be expressed.
pub struct ImageSource {
    inner: Inner,
}

impl ImageSource {
    /// Source over an in-memory image. The image must be slice-shaped.
    pub fn from_image(im: Image) -> Result<ImageSource> {
        check_image(&im)?;
        Ok(ImageSource {
            inner: Inner::Memory(Arc::new(im)),
        })
    }

    /// Source whose properties and data both come from the resolver.
    pub fn deferred(resolver: Box<dyn SliceResolver>) -> ImageSource {
        ImageSource {
            inner: Inner::Deferred {
                props: None,
                resolver,
            },
        }
    }

    /// Source with explicitly known properties; only `data()` consults the
    /// resolver.
    pub fn with_props(props: SliceProps, resolver: Box<dyn SliceResolver>) -> ImageSource {
        ImageSource {
            inner: Inner::Deferred {
                props: Some(props),
                resolver,
            },
        }
    }

    /// Shape and element type. Never materializes pixel data beyond what the
    /// resolver needs for a one-time property inspection.
    pub fn props(&mut self) -> Result<SliceProps> {
        match &mut self.inner {
            Inner::Memory(im) => Ok(SliceProps::of(im)),
            Inner::Deferred { props, resolver } => match props {
                Some(p) => Ok(*p),
                None => {
                    let p = resolver.resolve_props()?;
                    *props = Some(p);
                    Ok(p)
                }
            },
        }
    }

    /// Materialize the pixel data.
    pub fn data(&mut self) -> Result<Arc<Image>> {
        match &mut self.inner {
            Inner::Memory(im) => Ok(im.clone()),
            Inner::Deferred { props, resolver } => {
                let im = resolver.load()?;
                check_image(&im)?;
                if props.is_none() {
                    *props = Some(SliceProps::of(&im));
                }
                Ok(im)
            }
        }
    }
}

impl TryFrom<Image> for ImageSource {
    type Error = crate::error::Error;

    fn try_from(im: Image) -> Result<ImageSource> {
        ImageSource::from_image(im)
    }
}
