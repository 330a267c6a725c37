//! Mutable stacks of 2D image slices with lazy loading, plus consecutive
//! numbering and connected-component labeling over them.
//!
//! A stack is an ordered sequence of slices that may live in memory
//! ([`ArrayStack`], [`CollectionStack`]) or in files ([`FileImageStack`],
//! opened and created through the format registry). Slices load on demand
//! behind an optional LRU cache, and per-axis homogeneity (shape, dtype)
//! is tracked lazily. The [`label`] module numbers distinct values and
//! labels connected components, per slice or across whole stacks.
//!
//! ```no_run
//! use imstack::stack::registry::{self, Locator, StackOptions};
//! use imstack::stack::ImageStack;
//! use imstack::label::stacks::ConsecutiveNumberStack;
//!
//! # fn main() -> imstack::Result<()> {
//! let stack = registry::open(
//!     &Locator::path("segments.npy"),
//!     true,
//!     &StackOptions::new(),
//! )?;
//! let mut numbered = ConsecutiveNumberStack::whole_stack(stack, false)?;
//! println!("distinct labels: {}", numbered.max_label()?);
//! # Ok(())
//! # }
//! ```

pub mod dtype;
pub mod error;
pub mod formats;
pub mod image;
pub mod label;
pub mod source;
pub mod stack;

pub use error::{Error, Result};
pub use image::{check_image, Image};
pub use label::{label, number, relabel, shrink_integer};
pub use source::{ImageSource, SliceProps, SliceResolver};
pub use stack::file::FileImageStack;
pub use stack::registry::{FormatRegistry, Locator, MatchQuality, StackOptions};
pub use stack::{ArrayStack, CollectionStack, ImageStack, IndexSpec};
