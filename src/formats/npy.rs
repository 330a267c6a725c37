//! NumPy `.npy` volumes as homogeneous stacks.
//!
//! The whole stack is one 3D or 4D array in a single file, so every slice
//! shares one shape and element type and mutations rewrite the file. Good
//! for modest volumes that other tools should read directly.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;
use ndarray::{ArrayD, IxDyn};
use ndarray_npy::{ReadNpyExt, WriteNpyExt};
use serde_json::json;

use crate::dtype::{DataKind, MAX_CHANNELS};
use crate::error::{Error, Result};
use crate::image::{stack_images, Image};
use crate::source::{ImageSource, SliceProps};
use crate::stack::file::{FileImageStack, StackBackend};
use crate::stack::header::{Field, FieldRule, Header, NameRule};
use crate::stack::registry::{FileFormat, Locator, MatchQuality, StackOptions};

const MAGIC: &[u8] = b"\x93NUMPY";

/// Stacks stored as a single `.npy` array file.
pub struct NpyVolumeFormat;

fn single_path(locator: &Locator) -> Option<&Path> {
    match locator {
        Locator::Path(p) => Some(p),
        Locator::Files(_) => None,
    }
}

/// Decode bytes as an array of any supported element type.
fn read_volume(bytes: &[u8]) -> Result<Image> {
    macro_rules! try_read {
        ($($t:ty),*) => {
            $(
                if let Ok(a) = ArrayD::<$t>::read_npy(Cursor::new(bytes)) {
                    return Ok(Image::from(a));
                }
            )*
        };
    }
    try_read!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64, bool);
    // re-run one decode so the reported error is the library's own
    match ArrayD::<u8>::read_npy(Cursor::new(bytes)) {
        Err(e) => Err(Error::NpyRead(e)),
        Ok(_) => unreachable!("decode succeeded on retry"),
    }
}

fn write_volume(path: &Path, volume: &Image) -> Result<()> {
    let out = BufWriter::new(File::create(path)?);
    crate::image::with_image!(volume, a => a.write_npy(out))?;
    Ok(())
}

/// An all-zero-depth volume carrying the shape and dtype of `props`.
fn empty_volume(props: &SliceProps) -> Image {
    let (h, w) = props.shape;
    let c = props.element_type.channels as usize;
    let dims = if c == 1 {
        IxDyn(&[0, h, w])
    } else {
        IxDyn(&[0, h, w, c])
    };
    match (props.element_type.kind, props.element_type.bytes) {
        (DataKind::UnsignedInt, 1) => Image::from(ArrayD::<u8>::zeros(dims)),
        (DataKind::UnsignedInt, 2) => Image::from(ArrayD::<u16>::zeros(dims)),
        (DataKind::UnsignedInt, 4) => Image::from(ArrayD::<u32>::zeros(dims)),
        (DataKind::UnsignedInt, 8) => Image::from(ArrayD::<u64>::zeros(dims)),
        (DataKind::SignedInt, 1) => Image::from(ArrayD::<i8>::zeros(dims)),
        (DataKind::SignedInt, 2) => Image::from(ArrayD::<i16>::zeros(dims)),
        (DataKind::SignedInt, 4) => Image::from(ArrayD::<i32>::zeros(dims)),
        (DataKind::SignedInt, 8) => Image::from(ArrayD::<i64>::zeros(dims)),
        (DataKind::Float, 4) => Image::from(ArrayD::<f32>::zeros(dims)),
        (DataKind::Float, 8) => Image::from(ArrayD::<f64>::zeros(dims)),
        (DataKind::Bool, _) => Image::from(ArrayD::<bool>::from_elem(dims, false)),
        _ => unreachable!("widths are validated by ElementType::new"),
    }
}

struct NpyBackend {
    path: PathBuf,
    slices: Vec<Arc<Image>>,
    /// Uniform properties every slice must keep matching.
    props: SliceProps,
}

impl NpyBackend {
    fn check_congruent(&self, im: &Image) -> Result<SliceProps> {
        let p = SliceProps::of(im);
        if p.shape != self.props.shape
            || !p.element_type.congruent(&self.props.element_type)
        {
            return Err(Error::validation(format!(
                "volume stacks are homogeneous: existing slices are {} {}x{}, new slice is {} {}x{}",
                self.props.element_type,
                self.props.shape.0,
                self.props.shape.1,
                p.element_type,
                p.shape.0,
                p.shape.1
            )));
        }
        Ok(p)
    }

    /// Write a candidate slice vector out, committing it only on success.
    fn flush(&mut self, candidate: Vec<Arc<Image>>) -> Result<()> {
        let volume = if candidate.is_empty() {
            empty_volume(&self.props)
        } else {
            stack_images(&candidate)?
        };
        write_volume(&self.path, &volume)?;
        self.slices = candidate;
        Ok(())
    }
}

impl StackBackend for NpyBackend {
    fn slice_props(&mut self, _z: usize) -> Result<SliceProps> {
        Ok(self.props)
    }

    fn read_slice(&mut self, z: usize) -> Result<Arc<Image>> {
        Ok(Arc::clone(&self.slices[z]))
    }

    fn write_slice(&mut self, z: usize, im: &Image) -> Result<SliceProps> {
        let p = self.check_congruent(im)?;
        let mut candidate = self.slices.clone();
        candidate[z] = Arc::new(im.clone());
        self.flush(candidate)?;
        Ok(p)
    }

    fn insert_slice(&mut self, z: usize, im: &Image) -> Result<SliceProps> {
        let p = self.check_congruent(im)?;
        let mut candidate = self.slices.clone();
        candidate.insert(z, Arc::new(im.clone()));
        self.flush(candidate)?;
        Ok(p)
    }

    fn delete_range(&mut self, start: usize, stop: usize) -> Result<()> {
        let mut candidate = self.slices.clone();
        candidate.drain(start..stop);
        self.flush(candidate)
    }

    // shape and dtype are intrinsic to the array file, nothing extra to save
    fn save_header(&mut self, _header: &Header) -> Result<()> {
        Ok(())
    }
}

fn declared_fields() -> BTreeMap<String, Field> {
    let nonneg = FieldRule::Int {
        min: Some(0),
        max: None,
    };
    let mut fields = BTreeMap::new();
    fields.insert(
        "format".to_string(),
        Field::new(FieldRule::Fixed(json!("npy"))).read_only().required(),
    );
    fields.insert(
        "depth".to_string(),
        Field::new(nonneg.clone()).read_only().required(),
    );
    fields.insert(
        "height".to_string(),
        Field::new(nonneg.clone()).read_only().required(),
    );
    fields.insert(
        "width".to_string(),
        Field::new(nonneg).read_only().required(),
    );
    fields.insert(
        "dtype".to_string(),
        Field::new(FieldRule::Str).read_only().required(),
    );
    fields
}

fn build_header(props: &SliceProps, depth: usize) -> Result<Header> {
    let mut data = BTreeMap::new();
    data.insert("format".to_string(), json!("npy"));
    data.insert("depth".to_string(), json!(depth));
    data.insert("height".to_string(), json!(props.shape.0));
    data.insert("width".to_string(), json!(props.shape.1));
    data.insert("dtype".to_string(), json!(props.element_type.to_string()));
    Header::new(declared_fields(), NameRule::DeclaredOnly)
        .with_depth_field("depth")
        .with_data(data)
}

fn stack_from_volume(path: PathBuf, volume: Image, readonly: bool) -> Result<FileImageStack> {
    let shape = volume.raw_shape().to_vec();
    let (depth, h, w, c) = match shape[..] {
        [d, h, w] => (d, h, w, 1),
        [d, h, w, c] if (1..=MAX_CHANNELS).contains(&c) => (d, h, w, c),
        _ => {
            return Err(Error::validation(format!(
                "expected a 3D or 4D array, got shape {shape:?}"
            )));
        }
    };
    let element_type = volume.scalar_type().with_channels(c as u8)?;
    let props = SliceProps {
        element_type,
        shape: (h, w),
    };
    let slices = (0..depth)
        .map(|z| Arc::new(volume.index_slice(z)))
        .collect();
    let header = build_header(&props, depth)?;
    let backend = NpyBackend {
        path,
        slices,
        props,
    };
    Ok(FileImageStack::new(Box::new(backend), header, depth, readonly))
}

impl FileFormat for NpyVolumeFormat {
    fn id(&self) -> &'static str {
        "npy"
    }

    fn display_name(&self) -> &'static str {
        "NumPy array volume"
    }

    fn can_read(&self) -> bool {
        true
    }

    fn can_write(&self) -> bool {
        true
    }

    fn probe_open(&self, locator: &Locator, _options: &StackOptions) -> Result<MatchQuality> {
        let Some(path) = single_path(locator) else {
            return Ok(MatchQuality::NotAtAll);
        };
        if !path.is_file() {
            return Ok(MatchQuality::NotAtAll);
        }
        let mut head = [0u8; 6];
        let mut f = File::open(path)?;
        match f.read_exact(&mut head) {
            Ok(()) if head == *MAGIC => Ok(MatchQuality::Definitely),
            _ => Ok(MatchQuality::NotAtAll),
        }
    }

    fn probe_create(&self, locator: &Locator, _options: &StackOptions) -> MatchQuality {
        match single_path(locator).and_then(|p| {
            p.extension().map(|e| e.to_string_lossy().to_lowercase())
        }) {
            Some(ext) if ext == "npy" => MatchQuality::Definitely,
            _ => MatchQuality::NotAtAll,
        }
    }

    fn open(
        &self,
        locator: &Locator,
        readonly: bool,
        _options: &StackOptions,
    ) -> Result<FileImageStack> {
        let path = single_path(locator).ok_or_else(|| Error::UnknownFormat {
            locator: "file list".to_string(),
        })?;
        debug!("reading npy volume from {}", path.display());
        let bytes = std::fs::read(path)?;
        let volume = read_volume(&bytes)?;
        stack_from_volume(path.to_path_buf(), volume, readonly)
    }

    fn create(
        &self,
        locator: &Locator,
        mut sources: Vec<ImageSource>,
        _options: &StackOptions,
    ) -> Result<FileImageStack> {
        let path = single_path(locator).ok_or_else(|| Error::UnknownFormat {
            locator: "file list".to_string(),
        })?;
        if sources.is_empty() {
            return Err(Error::validation(
                "creating a volume stack needs at least one slice to fix shape and dtype",
            ));
        }
        let mut slices = Vec::with_capacity(sources.len());
        for s in &mut sources {
            let im = s.data()?;
            crate::image::check_image(&im)?;
            slices.push(im);
        }
        let volume = stack_images(&slices)?;
        write_volume(path, &volume)?;
        debug!(
            "created npy volume {} with {} slices",
            path.display(),
            slices.len()
        );
        stack_from_volume(path.to_path_buf(), volume, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::ElementType;
    use ndarray::{Array2, Array3};

    #[test]
    fn test_read_volume_round_trip_bytes() {
        let a = ArrayD::<u16>::zeros(IxDyn(&[2, 3, 4]));
        let mut bytes = Vec::new();
        a.write_npy(&mut bytes).unwrap();
        assert!(bytes.starts_with(MAGIC));

        match read_volume(&bytes).unwrap() {
            Image::U16(b) => assert_eq!(b.shape(), &[2, 3, 4]),
            other => panic!("unexpected variant {}", other.element_type()),
        }
    }

    #[test]
    fn test_read_volume_rejects_garbage() {
        assert!(read_volume(b"not an array").is_err());
    }

    #[test]
    fn test_empty_volume_keeps_layout() {
        let et = ElementType::new(DataKind::Float, 4)
            .unwrap()
            .with_channels(3)
            .unwrap();
        let props = SliceProps {
            element_type: et,
            shape: (5, 7),
        };
        match empty_volume(&props) {
            Image::F32(a) => assert_eq!(a.shape(), &[0, 5, 7, 3]),
            other => panic!("unexpected variant {}", other.element_type()),
        }
    }

    #[test]
    fn test_backend_rejects_incongruent_write() {
        let s0 = Arc::new(Image::from(Array2::<u8>::zeros((2, 2))));
        let mut backend = NpyBackend {
            path: PathBuf::from("unused.npy"),
            slices: vec![Arc::clone(&s0)],
            props: SliceProps::of(&s0),
        };
        let wrong = Image::from(Array2::<u16>::zeros((2, 2)));
        assert!(backend.write_slice(0, &wrong).is_err());
        let wrong_shape = Image::from(Array2::<u8>::zeros((3, 3)));
        assert!(backend.write_slice(0, &wrong_shape).is_err());
        // the failed writes left the slice alone
        assert_eq!(*backend.read_slice(0).unwrap(), *s0);
    }

    #[test]
    fn test_stack_from_volume_validates_shape() {
        let flat = Image::from(Array2::<u8>::zeros((2, 2)));
        assert!(stack_from_volume(PathBuf::from("x.npy"), flat, true).is_err());

        let vol = Image::from(Array3::<u8>::zeros((2, 3, 3)));
        let stack = stack_from_volume(PathBuf::from("x.npy"), vol, true).unwrap();
        assert_eq!(stack.header().get("depth"), Some(&json!(2)));
        assert_eq!(stack.header().get("dtype"), Some(&json!("u8")));
    }
}
