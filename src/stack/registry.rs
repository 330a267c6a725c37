//! File format registration and dispatch.
//!
//! Formats self-describe through [`FileFormat`] and are probed in
//! registration order; the best match wins. A process-wide registry with
//! the builtin formats backs the module-level [`open`] and [`create`]
//! functions.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::source::ImageSource;

use super::file::FileImageStack;

/// How confident a format is that a locator is (or can become) its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchQuality {
    NotAtAll,
    Unlikely,
    Maybe,
    Likely,
    Definitely,
}

/// What a stack lives in: a single path (file or directory) or an explicit
/// ordered file list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    Path(PathBuf),
    Files(Vec<PathBuf>),
}

impl Locator {
    pub fn path(p: impl Into<PathBuf>) -> Locator {
        Locator::Path(p.into())
    }

    pub fn files(files: impl IntoIterator<Item = impl Into<PathBuf>>) -> Locator {
        Locator::Files(files.into_iter().map(Into::into).collect())
    }

    fn describe(&self) -> String {
        match self {
            Locator::Path(p) => p.display().to_string(),
            Locator::Files(files) => format!("{} files", files.len()),
        }
    }
}

/// Free-form format options, e.g. a filename pattern for directory stacks.
pub type StackOptions = BTreeMap<String, String>;

/// One file format. Implementations are stateless descriptors; all state
/// lives in the stacks they open.
pub trait FileFormat: Send {
    /// Short stable identifier, e.g. "npy".
    fn id(&self) -> &'static str;

    fn display_name(&self) -> &'static str;

    fn can_read(&self) -> bool;

    fn can_write(&self) -> bool;

    /// How well existing storage at `locator` matches this format. Should
    /// inspect content (magic bytes) where possible, not just names.
    fn probe_open(&self, locator: &Locator, options: &StackOptions) -> Result<MatchQuality>;

    /// How suitable `locator` is for creating a new stack of this format.
    /// Purely name-based, the storage need not exist.
    fn probe_create(&self, locator: &Locator, options: &StackOptions) -> MatchQuality;

    fn open(
        &self,
        locator: &Locator,
        readonly: bool,
        options: &StackOptions,
    ) -> Result<FileImageStack>;

    fn create(
        &self,
        locator: &Locator,
        sources: Vec<ImageSource>,
        options: &StackOptions,
    ) -> Result<FileImageStack>;
}

/// Ordered collection of formats. Builtins are registered by [`new`];
/// additional formats append after them and never displace earlier ones.
pub struct FormatRegistry {
    formats: Vec<Box<dyn FileFormat>>,
}

impl FormatRegistry {
    /// A registry with the builtin formats.
    pub fn new() -> FormatRegistry {
        let mut registry = FormatRegistry {
            formats: Vec::new(),
        };
        registry.register(Box::new(crate::formats::NpyVolumeFormat));
        registry.register(Box::new(crate::formats::ImageDirFormat));
        registry
    }

    /// An empty registry, for callers assembling their own format set.
    pub fn empty() -> FormatRegistry {
        FormatRegistry {
            formats: Vec::new(),
        }
    }

    pub fn register(&mut self, format: Box<dyn FileFormat>) {
        debug!("registered format {}", format.id());
        self.formats.push(format);
    }

    pub fn get(&self, id: &str) -> Option<&dyn FileFormat> {
        self.formats.iter().map(|f| f.as_ref()).find(|f| f.id() == id)
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.formats.iter().map(|f| f.id()).collect()
    }

    /// The readable format best matching existing storage. A probe error
    /// counts as no match for that format; a `Definitely` stops the search.
    fn best_for_open(
        &self,
        locator: &Locator,
        options: &StackOptions,
    ) -> Result<&dyn FileFormat> {
        let mut best: Option<(&dyn FileFormat, MatchQuality)> = None;
        for format in self.formats.iter().filter(|f| f.can_read()) {
            let quality = match format.probe_open(locator, options) {
                Ok(q) => q,
                Err(e) => {
                    warn!("format {} failed to probe {}: {e}", format.id(), locator.describe());
                    MatchQuality::NotAtAll
                }
            };
            if quality == MatchQuality::Definitely {
                return Ok(format.as_ref());
            }
            if quality > MatchQuality::NotAtAll
                && best.map_or(true, |(_, bq)| quality > bq)
            {
                best = Some((format.as_ref(), quality));
            }
        }
        best.map(|(f, _)| f).ok_or_else(|| Error::UnknownFormat {
            locator: locator.describe(),
        })
    }

    fn best_for_create(
        &self,
        locator: &Locator,
        options: &StackOptions,
    ) -> Result<&dyn FileFormat> {
        let mut best: Option<(&dyn FileFormat, MatchQuality)> = None;
        for format in self.formats.iter().filter(|f| f.can_write()) {
            let quality = format.probe_create(locator, options);
            if quality == MatchQuality::Definitely {
                return Ok(format.as_ref());
            }
            if quality > MatchQuality::NotAtAll
                && best.map_or(true, |(_, bq)| quality > bq)
            {
                best = Some((format.as_ref(), quality));
            }
        }
        best.map(|(f, _)| f).ok_or_else(|| Error::UnknownFormat {
            locator: locator.describe(),
        })
    }

    /// Whether any registered format recognizes existing storage here.
    pub fn openable(&self, locator: &Locator, options: &StackOptions) -> bool {
        self.best_for_open(locator, options).is_ok()
    }

    /// Whether any registered format would create a stack here.
    pub fn creatable(&self, locator: &Locator, options: &StackOptions) -> bool {
        self.best_for_create(locator, options).is_ok()
    }

    /// Open an existing stack with the best-matching format.
    pub fn open(
        &self,
        locator: &Locator,
        readonly: bool,
        options: &StackOptions,
    ) -> Result<FileImageStack> {
        let format = self.best_for_open(locator, options)?;
        debug!("opening {} as {}", locator.describe(), format.id());
        format.open(locator, readonly, options)
    }

    /// Create a new stack with the best-matching format, seeded with the
    /// given slices.
    pub fn create(
        &self,
        locator: &Locator,
        sources: Vec<ImageSource>,
        options: &StackOptions,
    ) -> Result<FileImageStack> {
        let format = self.best_for_create(locator, options)?;
        debug!("creating {} as {}", locator.describe(), format.id());
        format.create(locator, sources, options)
    }
}

impl Default for FormatRegistry {
    fn default() -> FormatRegistry {
        FormatRegistry::new()
    }
}

fn global() -> &'static Mutex<FormatRegistry> {
    static REGISTRY: OnceLock<Mutex<FormatRegistry>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(FormatRegistry::new()))
}

/// Register a format with the process-wide registry.
pub fn register(format: Box<dyn FileFormat>) {
    global().lock().expect("registry poisoned").register(format);
}

/// Open an existing stack via the process-wide registry.
pub fn open(locator: &Locator, readonly: bool, options: &StackOptions) -> Result<FileImageStack> {
    global()
        .lock()
        .expect("registry poisoned")
        .open(locator, readonly, options)
}

/// Create a new stack via the process-wide registry.
pub fn create(
    locator: &Locator,
    sources: Vec<ImageSource>,
    options: &StackOptions,
) -> Result<FileImageStack> {
    global()
        .lock()
        .expect("registry poisoned")
        .create(locator, sources, options)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeFormat {
        id: &'static str,
        open_quality: MatchQuality,
    }

    impl FileFormat for FakeFormat {
        fn id(&self) -> &'static str {
            self.id
        }
        fn display_name(&self) -> &'static str {
            "fake"
        }
        fn can_read(&self) -> bool {
            true
        }
        fn can_write(&self) -> bool {
            false
        }
        fn probe_open(&self, _: &Locator, _: &StackOptions) -> Result<MatchQuality> {
            Ok(self.open_quality)
        }
        fn probe_create(&self, _: &Locator, _: &StackOptions) -> MatchQuality {
            MatchQuality::NotAtAll
        }
        fn open(&self, _: &Locator, _: bool, _: &StackOptions) -> Result<FileImageStack> {
            Err(Error::validation("not openable in tests"))
        }
        fn create(
            &self,
            _: &Locator,
            _: Vec<ImageSource>,
            _: &StackOptions,
        ) -> Result<FileImageStack> {
            Err(Error::validation("not creatable in tests"))
        }
    }

    #[test]
    fn test_quality_ordering() {
        assert!(MatchQuality::Definitely > MatchQuality::Likely);
        assert!(MatchQuality::Likely > MatchQuality::Maybe);
        assert!(MatchQuality::Maybe > MatchQuality::Unlikely);
        assert!(MatchQuality::Unlikely > MatchQuality::NotAtAll);
    }

    #[test]
    fn test_best_match_wins() {
        let mut registry = FormatRegistry::empty();
        registry.register(Box::new(FakeFormat {
            id: "weak",
            open_quality: MatchQuality::Maybe,
        }));
        registry.register(Box::new(FakeFormat {
            id: "strong",
            open_quality: MatchQuality::Likely,
        }));

        let locator = Locator::path("whatever.bin");
        let best = registry
            .best_for_open(&locator, &StackOptions::new())
            .unwrap();
        assert_eq!(best.id(), "strong");
    }

    #[test]
    fn test_earlier_registration_breaks_ties() {
        let mut registry = FormatRegistry::empty();
        registry.register(Box::new(FakeFormat {
            id: "first",
            open_quality: MatchQuality::Maybe,
        }));
        registry.register(Box::new(FakeFormat {
            id: "second",
            open_quality: MatchQuality::Maybe,
        }));

        let locator = Locator::path("whatever.bin");
        let best = registry
            .best_for_open(&locator, &StackOptions::new())
            .unwrap();
        assert_eq!(best.id(), "first");
    }

    #[test]
    fn test_no_match_is_an_error() {
        let registry = FormatRegistry::empty();
        let locator = Locator::path("whatever.bin");
        let err = registry
            .open(&locator, true, &StackOptions::new())
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, Error::UnknownFormat { .. }));
    }

    #[test]
    fn test_builtin_ids() {
        let registry = FormatRegistry::new();
        let ids = registry.ids();
        assert!(ids.contains(&"npy"));
        assert!(ids.contains(&"imagedir"));
        assert!(registry.get("npy").is_some());
        assert!(registry.get("nope").is_none());
    }
}
