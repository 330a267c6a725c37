//! Builtin file formats.

mod imagedir;
mod npy;

pub use imagedir::ImageDirFormat;
pub use npy::NpyVolumeFormat;
