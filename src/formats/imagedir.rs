//! Stacks of ordinary image files, one file per slice.
//!
//! The slices come from a directory listing (sorted by name) or an explicit
//! file list, so shapes and dtypes may differ per slice. User metadata is
//! kept in a `stack.json` sidecar next to the images.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::{DynamicImage, ImageBuffer};
use log::{debug, warn};
use ndarray::{Array2, Array3, ArrayD};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::image::Image;
use crate::source::{ImageSource, SliceProps};
use crate::stack::file::{FileImageStack, StackBackend};
use crate::stack::header::{Field, FieldRule, Header, HeaderValue, NameRule};
use crate::stack::registry::{FileFormat, Locator, MatchQuality, StackOptions};

const SIDECAR_NAME: &str = "stack.json";
const SIDECAR_VERSION: u32 = 1;
const DEFAULT_PATTERN: &str = "%04d.png";

const IMAGE_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "bmp", "gif", "tif", "tiff", "webp", "pgm", "ppm", "tga",
];

/// Stacks of per-slice image files in a directory or explicit list.
pub struct ImageDirFormat;

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.as_str()))
}

/// Image files in `dir`, sorted by file name.
fn list_slices(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && has_image_extension(p))
        .collect();
    files.sort();
    Ok(files)
}

/// Expand a `%d` / `%0Nd` pattern with a slice number.
fn expand_pattern(pattern: &str, n: usize) -> Result<String> {
    let Some(pos) = pattern.find('%') else {
        return Err(Error::validation(format!(
            "file pattern {pattern:?} has no %d placeholder"
        )));
    };
    let rest = &pattern[pos + 1..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    let after = &rest[digits.len()..];
    if !after.starts_with('d') {
        return Err(Error::validation(format!(
            "file pattern {pattern:?} has no %d placeholder"
        )));
    }
    let width: usize = if digits.is_empty() {
        0
    } else {
        digits
            .parse()
            .map_err(|_| Error::validation(format!("bad pad width in pattern {pattern:?}")))?
    };
    Ok(format!(
        "{}{:0>w$}{}",
        &pattern[..pos],
        n,
        &after[1..],
        w = width
    ))
}

fn decode_file(path: &Path) -> Result<Image> {
    let dynamic = image::open(path)?;
    dynamic_to_image(dynamic, path)
}

fn array2<T>(w: u32, h: u32, raw: Vec<T>) -> Result<Image>
where
    Image: From<ArrayD<T>>,
{
    Array2::from_shape_vec((h as usize, w as usize), raw)
        .map(|a| Image::from(a.into_dyn()))
        .map_err(|e| Error::validation(format!("inconsistent decoded buffer: {e}")))
}

fn array3<T>(w: u32, h: u32, c: usize, raw: Vec<T>) -> Result<Image>
where
    Image: From<ArrayD<T>>,
{
    Array3::from_shape_vec((h as usize, w as usize, c), raw)
        .map(|a| Image::from(a.into_dyn()))
        .map_err(|e| Error::validation(format!("inconsistent decoded buffer: {e}")))
}

fn dynamic_to_image(dynamic: DynamicImage, path: &Path) -> Result<Image> {
    let (w, h) = (dynamic.width(), dynamic.height());
    match dynamic {
        DynamicImage::ImageLuma8(b) => array2(w, h, b.into_raw()),
        DynamicImage::ImageLumaA8(b) => array3(w, h, 2, b.into_raw()),
        DynamicImage::ImageRgb8(b) => array3(w, h, 3, b.into_raw()),
        DynamicImage::ImageRgba8(b) => array3(w, h, 4, b.into_raw()),
        DynamicImage::ImageLuma16(b) => array2(w, h, b.into_raw()),
        DynamicImage::ImageLumaA16(b) => array3(w, h, 2, b.into_raw()),
        DynamicImage::ImageRgb16(b) => array3(w, h, 3, b.into_raw()),
        DynamicImage::ImageRgba16(b) => array3(w, h, 4, b.into_raw()),
        DynamicImage::ImageRgb32F(b) => array3(w, h, 3, b.into_raw()),
        DynamicImage::ImageRgba32F(b) => array3(w, h, 4, b.into_raw()),
        other => Err(Error::validation(format!(
            "{}: unsupported pixel layout {:?}",
            path.display(),
            other.color()
        ))),
    }
}

/// Convert a slice to something the codecs accept. 8-bit images take any
/// channel count; 16-bit images must be gray, rgb or rgba.
fn image_to_dynamic(im: &Image) -> Result<DynamicImage> {
    fn buffer<P: image::Pixel>(
        w: u32,
        h: u32,
        raw: Vec<P::Subpixel>,
    ) -> Result<ImageBuffer<P, Vec<P::Subpixel>>> {
        ImageBuffer::from_raw(w, h, raw)
            .ok_or_else(|| Error::validation("pixel buffer does not match its shape"))
    }

    let (h, w) = im.shape();
    let (w, h) = (w as u32, h as u32);
    let c = im.channels();
    match im {
        Image::U8(a) => {
            let raw = Image::flat_values(a).into_owned();
            Ok(match c {
                1 => DynamicImage::ImageLuma8(buffer(w, h, raw)?),
                2 => DynamicImage::ImageLumaA8(buffer(w, h, raw)?),
                3 => DynamicImage::ImageRgb8(buffer(w, h, raw)?),
                _ => DynamicImage::ImageRgba8(buffer(w, h, raw)?),
            })
        }
        Image::U16(a) => {
            let raw = Image::flat_values(a).into_owned();
            match c {
                1 => Ok(DynamicImage::ImageLuma16(buffer(w, h, raw)?)),
                3 => Ok(DynamicImage::ImageRgb16(buffer(w, h, raw)?)),
                4 => Ok(DynamicImage::ImageRgba16(buffer(w, h, raw)?)),
                _ => Err(Error::validation(
                    "16-bit slices must have 1, 3 or 4 channels",
                )),
            }
        }
        other => Err(Error::validation(format!(
            "cannot encode {} slices as image files, convert to u8 or u16 first",
            other.element_type()
        ))),
    }
}

#[derive(Serialize, Deserialize)]
struct Sidecar {
    version: u32,
    #[serde(default)]
    fields: BTreeMap<String, HeaderValue>,
}

fn read_sidecar(dir: &Path) -> Result<BTreeMap<String, HeaderValue>> {
    let path = dir.join(SIDECAR_NAME);
    if !path.is_file() {
        return Ok(BTreeMap::new());
    }
    let sidecar: Sidecar = serde_json::from_reader(fs::File::open(&path)?)?;
    if sidecar.version > SIDECAR_VERSION {
        warn!(
            "{} has version {}, newer than supported {}",
            path.display(),
            sidecar.version,
            SIDECAR_VERSION
        );
    }
    Ok(sidecar.fields)
}

struct ImageDirBackend {
    /// Directory holding the sidecar; absent for explicit file lists.
    dir: Option<PathBuf>,
    files: Vec<PathBuf>,
    pattern: String,
}

impl ImageDirBackend {
    /// A path for a new slice that does not collide with an existing file.
    fn mint_path(&self) -> Result<PathBuf> {
        let dir = self.dir.as_deref().ok_or_else(|| {
            Error::validation("cannot add slices to an explicit file list without a directory")
        })?;
        let mut n = self.files.len();
        loop {
            let candidate = dir.join(expand_pattern(&self.pattern, n)?);
            if !candidate.exists() {
                return Ok(candidate);
            }
            n += 1;
        }
    }
}

impl StackBackend for ImageDirBackend {
    fn slice_props(&mut self, z: usize) -> Result<SliceProps> {
        // dtype requires a decode anyway; the caller memoizes the result
        Ok(SliceProps::of(&decode_file(&self.files[z])?))
    }

    fn read_slice(&mut self, z: usize) -> Result<Arc<Image>> {
        Ok(Arc::new(decode_file(&self.files[z])?))
    }

    fn write_slice(&mut self, z: usize, im: &Image) -> Result<SliceProps> {
        let dynamic = image_to_dynamic(im)?;
        dynamic.save(&self.files[z])?;
        Ok(SliceProps::of(im))
    }

    fn insert_slice(&mut self, z: usize, im: &Image) -> Result<SliceProps> {
        let dynamic = image_to_dynamic(im)?;
        let path = self.mint_path()?;
        dynamic.save(&path)?;
        debug!("added slice file {}", path.display());
        self.files.insert(z, path);
        Ok(SliceProps::of(im))
    }

    fn delete_range(&mut self, start: usize, stop: usize) -> Result<()> {
        for path in &self.files[start..stop] {
            fs::remove_file(path)?;
            debug!("removed slice file {}", path.display());
        }
        self.files.drain(start..stop);
        Ok(())
    }

    fn save_header(&mut self, header: &Header) -> Result<()> {
        let dir = self.dir.as_deref().ok_or_else(|| {
            Error::validation("explicit file lists have nowhere to keep a header")
        })?;
        let sidecar = Sidecar {
            version: SIDECAR_VERSION,
            fields: header
                .data()
                .iter()
                .filter(|(k, _)| k.as_str() != "depth")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        let path = dir.join(SIDECAR_NAME);
        serde_json::to_writer_pretty(fs::File::create(&path)?, &sidecar)?;
        Ok(())
    }
}

fn declared_fields() -> BTreeMap<String, Field> {
    let mut fields = BTreeMap::new();
    fields.insert(
        "depth".to_string(),
        Field::new(FieldRule::Int {
            min: Some(0),
            max: None,
        })
        .read_only()
        .required(),
    );
    fields
}

fn build_header(depth: usize, user_fields: BTreeMap<String, HeaderValue>) -> Result<Header> {
    let mut data = user_fields;
    data.insert("depth".to_string(), HeaderValue::from(depth));
    Header::new(declared_fields(), NameRule::Lowercase)
        .with_depth_field("depth")
        .with_data(data)
}

fn pattern_from(options: &StackOptions) -> String {
    options
        .get("pattern")
        .cloned()
        .unwrap_or_else(|| DEFAULT_PATTERN.to_string())
}

impl FileFormat for ImageDirFormat {
    fn id(&self) -> &'static str {
        "imagedir"
    }

    fn display_name(&self) -> &'static str {
        "directory of image files"
    }

    fn can_read(&self) -> bool {
        true
    }

    fn can_write(&self) -> bool {
        true
    }

    fn probe_open(&self, locator: &Locator, _options: &StackOptions) -> Result<MatchQuality> {
        match locator {
            Locator::Path(p) if p.is_dir() => {
                if list_slices(p)?.is_empty() {
                    Ok(MatchQuality::Unlikely)
                } else {
                    Ok(MatchQuality::Likely)
                }
            }
            Locator::Path(_) => Ok(MatchQuality::NotAtAll),
            Locator::Files(files) => {
                if !files.is_empty() && files.iter().all(|p| has_image_extension(p)) {
                    Ok(MatchQuality::Definitely)
                } else {
                    Ok(MatchQuality::NotAtAll)
                }
            }
        }
    }

    fn probe_create(&self, locator: &Locator, _options: &StackOptions) -> MatchQuality {
        match locator {
            Locator::Path(p) if p.is_dir() => MatchQuality::Definitely,
            // an extensionless path can become a directory
            Locator::Path(p) if p.extension().is_none() => MatchQuality::Likely,
            Locator::Path(_) => MatchQuality::NotAtAll,
            Locator::Files(files) => {
                if !files.is_empty() && files.iter().all(|p| has_image_extension(p)) {
                    MatchQuality::Definitely
                } else {
                    MatchQuality::NotAtAll
                }
            }
        }
    }

    fn open(
        &self,
        locator: &Locator,
        readonly: bool,
        options: &StackOptions,
    ) -> Result<FileImageStack> {
        let (dir, files) = match locator {
            Locator::Path(p) => (Some(p.clone()), list_slices(p)?),
            Locator::Files(files) => {
                for f in files {
                    if !f.is_file() {
                        return Err(Error::Io(std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            format!("{} does not exist", f.display()),
                        )));
                    }
                }
                (None, files.clone())
            }
        };
        debug!("opened image directory stack with {} slices", files.len());
        let user_fields = match &dir {
            Some(d) => read_sidecar(d)?,
            None => BTreeMap::new(),
        };
        let header = build_header(files.len(), user_fields)?;
        let depth = files.len();
        let backend = ImageDirBackend {
            dir,
            files,
            pattern: pattern_from(options),
        };
        Ok(FileImageStack::new(Box::new(backend), header, depth, readonly))
    }

    fn create(
        &self,
        locator: &Locator,
        mut sources: Vec<ImageSource>,
        options: &StackOptions,
    ) -> Result<FileImageStack> {
        let pattern = pattern_from(options);
        let (dir, paths) = match locator {
            Locator::Path(p) => {
                fs::create_dir_all(p)?;
                let paths = (0..sources.len())
                    .map(|n| Ok(p.join(expand_pattern(&pattern, n)?)))
                    .collect::<Result<Vec<_>>>()?;
                (Some(p.clone()), paths)
            }
            Locator::Files(files) => {
                if files.len() != sources.len() {
                    return Err(Error::validation(format!(
                        "{} file names for {} slices",
                        files.len(),
                        sources.len()
                    )));
                }
                (None, files.clone())
            }
        };
        for (src, path) in sources.iter_mut().zip(&paths) {
            let im = src.data()?;
            crate::image::check_image(&im)?;
            image_to_dynamic(&im)?.save(path)?;
        }
        debug!("created image directory stack with {} slices", paths.len());
        let header = build_header(paths.len(), BTreeMap::new())?;
        let depth = paths.len();
        let backend = ImageDirBackend {
            dir,
            files: paths,
            pattern,
        };
        Ok(FileImageStack::new(Box::new(backend), header, depth, false))
    }
}
