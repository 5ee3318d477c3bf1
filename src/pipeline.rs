//! Import orchestration: decode, fingerprint, look up history, record.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use image::{ColorType, DynamicImage, GenericImageView, ImageFormat};
use rayon::prelude::*;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::{Config, default_supported_extensions};
use crate::error::{DecodeError, HashSizeError, ImportError};
use crate::fingerprint::{self, Fingerprint, GroupKey};
use crate::hashing::{HashComputer, PerceptualHashes};
use crate::similarity::{self, DEFAULT_THRESHOLD, LIKELY_SAME_THRESHOLD, Similarity, SimilarityReport};
use crate::store::{FingerprintRecord, FingerprintStore, LocationEntry};

/// Encodes an image to disk, optionally embedding its fingerprint.
pub trait ImageWriter {
    fn write(
        &self,
        image: &DynamicImage,
        fingerprint: &Fingerprint,
        path: &Path,
    ) -> Result<(), image::ImageError>;
}

/// Writes pixels only, format chosen by extension. No metadata is embedded.
#[derive(Debug, Default, Clone, Copy)]
pub struct PixelWriter;

impl ImageWriter for PixelWriter {
    fn write(
        &self,
        image: &DynamicImage,
        fingerprint: &Fingerprint,
        path: &Path,
    ) -> Result<(), image::ImageError> {
        debug!("Writing {:?} (fingerprint {} not embedded)", path, fingerprint);
        match ImageFormat::from_path(path)? {
            // JPEG has no alpha channel.
            ImageFormat::Jpeg => DynamicImage::ImageRgb8(image.to_rgb8()).save(path),
            _ => image.save(path),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub threshold: f64,
    pub supported_extensions: Vec<String>,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            supported_extensions: default_supported_extensions(),
        }
    }
}

impl From<&Config> for ImportOptions {
    fn from(config: &Config) -> Self {
        Self {
            threshold: config.threshold,
            supported_extensions: config.supported_extensions.clone(),
        }
    }
}

/// A stored record that resembled an imported image, copied out of the store.
#[derive(Debug, Clone)]
pub struct KnownMatch {
    pub group_key: GroupKey,
    pub record: FingerprintRecord,
    pub similarity: Similarity,
}

impl KnownMatch {
    pub fn is_likely_same(&self) -> bool {
        self.similarity.combined > LIKELY_SAME_THRESHOLD
    }
}

/// Read-only lookup result for one image.
#[derive(Debug)]
pub struct Identification<'a> {
    pub hashes: PerceptualHashes,
    pub fingerprint: Fingerprint,
    pub group_key: GroupKey,
    pub report: SimilarityReport<'a>,
}

#[derive(Debug, Clone)]
pub struct ImportOutcome {
    pub path: PathBuf,
    pub filename: String,
    pub width: u32,
    pub height: u32,
    pub color: ColorType,
    pub format: Option<ImageFormat>,
    pub file_size: u64,
    pub content_id: String,
    pub fingerprint: Fingerprint,
    pub group_key: GroupKey,
    /// History as it was before this import, best first.
    pub matches: Vec<KnownMatch>,
    pub skipped: usize,
    /// Whether this import created the record.
    pub is_new: bool,
    pub count: u64,
    pub imported_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SaveOutcome {
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
    pub group_key: GroupKey,
    pub file_size: u64,
    pub count: u64,
}

/// Hashed, not yet recorded. The decoded pixels are dropped at this point so
/// a batch never holds more than one bitmap per worker.
struct Prepared {
    path: PathBuf,
    width: u32,
    height: u32,
    color: ColorType,
    format: Option<ImageFormat>,
    content_id: String,
    hashes: PerceptualHashes,
    location: LocationEntry,
}

pub struct ImportPipeline {
    computer: HashComputer,
    options: ImportOptions,
}

impl ImportPipeline {
    pub fn new(computer: HashComputer, options: ImportOptions) -> Self {
        Self { computer, options }
    }

    pub fn from_config(config: &Config) -> Result<Self, HashSizeError> {
        Ok(Self::new(
            HashComputer::with_hash_size(config.hash_size)?,
            ImportOptions::from(config),
        ))
    }

    pub fn options(&self) -> &ImportOptions {
        &self.options
    }

    pub fn is_supported(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                self.options
                    .supported_extensions
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false)
    }

    /// Looks `image` up in `store` without recording it.
    pub fn identify<'a>(
        &self,
        store: &'a FingerprintStore,
        image: &DynamicImage,
    ) -> Result<Identification<'a>, DecodeError> {
        let hashes = self.computer.compute_hashes(image)?;
        Ok(self.identify_hashes(store, hashes))
    }

    pub fn identify_bytes<'a>(
        &self,
        store: &'a FingerprintStore,
        bytes: &[u8],
    ) -> Result<Identification<'a>, DecodeError> {
        let decoded = HashComputer::decode_bytes(bytes)?;
        self.identify(store, &decoded.image)
    }

    /// Looks one file up without recording it. Each failure is confined to
    /// its file, so callers can report it and carry on.
    pub fn identify_path<'a>(
        &self,
        store: &'a FingerprintStore,
        path: &Path,
    ) -> Result<Identification<'a>, ImportError> {
        let decode_err = |source: DecodeError| ImportError::Decode {
            path: path.to_path_buf(),
            source,
        };
        let decoded = HashComputer::decode_path(path).map_err(decode_err)?;
        self.identify(store, &decoded.image).map_err(decode_err)
    }

    fn identify_hashes<'a>(
        &self,
        store: &'a FingerprintStore,
        hashes: PerceptualHashes,
    ) -> Identification<'a> {
        let (fingerprint, group_key) = fingerprint::build(&hashes);
        let report = similarity::find_similar(&hashes, store, self.options.threshold);
        Identification {
            hashes,
            fingerprint,
            group_key,
            report,
        }
    }

    /// Imports one image file: matches it against history, then records it.
    pub fn import_path(
        &self,
        store: &mut FingerprintStore,
        path: &Path,
    ) -> Result<ImportOutcome, ImportError> {
        let prepared = self.prepare(path)?;
        self.commit(store, prepared)
    }

    /// Imports many files. Decoding and hashing run in parallel; the store is
    /// updated one file at a time, in input order.
    pub fn import_batch<F>(
        &self,
        store: &mut FingerprintStore,
        paths: &[PathBuf],
        on_hashed: F,
    ) -> Vec<(PathBuf, Result<ImportOutcome, ImportError>)>
    where
        F: Fn(&Path) + Sync,
    {
        let prepared: Vec<_> = paths
            .par_iter()
            .map(|path| {
                let result = self.prepare(path);
                on_hashed(path);
                (path.clone(), result)
            })
            .collect();

        prepared
            .into_iter()
            .map(|(path, prepared)| {
                let result = match prepared {
                    Ok(prepared) => self.commit(store, prepared),
                    Err(e) => Err(e),
                };
                (path, result)
            })
            .collect()
    }

    /// Every supported image below `dir`, sorted.
    pub fn collect_images(&self, dir: &Path) -> Vec<PathBuf> {
        let mut images: Vec<PathBuf> = WalkDir::new(dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| self.is_supported(path))
            .collect();
        images.sort();
        images
    }

    /// Writes `image` to `output` through `writer` and records the new file.
    pub fn save(
        &self,
        store: &mut FingerprintStore,
        image: &DynamicImage,
        output: &Path,
        writer: &dyn ImageWriter,
    ) -> Result<SaveOutcome, ImportError> {
        let hashes = self
            .computer
            .compute_hashes(image)
            .map_err(|source| ImportError::Decode {
                path: output.to_path_buf(),
                source,
            })?;
        let (fingerprint, group_key) = fingerprint::build(&hashes);

        writer
            .write(image, &fingerprint, output)
            .map_err(|source| ImportError::Write {
                path: output.to_path_buf(),
                source,
            })?;

        let location = LocationEntry::for_file(output).map_err(|source| ImportError::Io {
            path: output.to_path_buf(),
            source,
        })?;
        let file_size = location.size;
        let filename = location.filename.clone();
        let record = store.upsert(group_key.clone(), fingerprint.clone(), filename, location)?;

        info!("Saved {:?} ({} bytes)", output, file_size);
        Ok(SaveOutcome {
            path: output.to_path_buf(),
            fingerprint,
            group_key,
            file_size,
            count: record.count,
        })
    }

    fn prepare(&self, path: &Path) -> Result<Prepared, ImportError> {
        if !path.exists() {
            return Err(ImportError::NotFound(path.to_path_buf()));
        }
        if !self.is_supported(path) {
            return Err(ImportError::UnsupportedFormat(path.to_path_buf()));
        }

        let decode_err = |source: DecodeError| ImportError::Decode {
            path: path.to_path_buf(),
            source,
        };
        let decoded = HashComputer::decode_path(path).map_err(decode_err)?;
        let hashes = self
            .computer
            .compute_hashes(&decoded.image)
            .map_err(decode_err)?;
        let location = LocationEntry::for_file(path).map_err(|source| ImportError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        debug!("Hashed {:?}", path);
        let (width, height) = decoded.image.dimensions();
        Ok(Prepared {
            path: path.to_path_buf(),
            width,
            height,
            color: decoded.image.color(),
            format: decoded.format,
            content_id: HashComputer::content_id(&decoded.image),
            hashes,
            location,
        })
    }

    fn commit(
        &self,
        store: &mut FingerprintStore,
        prepared: Prepared,
    ) -> Result<ImportOutcome, ImportError> {
        let Prepared {
            path,
            width,
            height,
            color,
            format,
            content_id,
            hashes,
            location,
        } = prepared;

        let (fingerprint, group_key, matches, skipped) = {
            let identification = self.identify_hashes(store, hashes);
            let matches: Vec<KnownMatch> = identification
                .report
                .matches
                .iter()
                .map(|m| KnownMatch {
                    group_key: m.group_key.clone(),
                    record: m.record.clone(),
                    similarity: m.similarity,
                })
                .collect();
            let skipped = identification.report.skipped.len();
            (identification.fingerprint, identification.group_key, matches, skipped)
        };

        let is_new = store.get(&group_key).is_none();
        let filename = location.filename.clone();
        let file_size = location.size;
        let imported_at = location.timestamp;
        let record = store.upsert(group_key.clone(), fingerprint.clone(), filename.clone(), location)?;
        let count = record.count;

        info!(
            "Imported {} ({}x{}), {} similar record(s)",
            filename,
            width,
            height,
            matches.len()
        );

        Ok(ImportOutcome {
            path,
            filename,
            width,
            height,
            color,
            format,
            file_size,
            content_id,
            fingerprint,
            group_key,
            matches,
            skipped,
            is_new,
            count,
            imported_at,
        })
    }
}

impl Default for ImportPipeline {
    fn default() -> Self {
        Self::new(HashComputer::new(), ImportOptions::default())
    }
}
