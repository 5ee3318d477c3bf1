//! Perceptual hashing.
//!
//! Three independent signatures are derived from every image with
//! `image_hasher`: average hash, DCT perceptual hash and difference hash.
//! Each is serialized as a lowercase hex token so it can be stored in the
//! fingerprint database and compared bit by bit later on.

use std::fmt;
use std::io::Cursor;
use std::path::Path;

use image::{DynamicImage, GenericImageView, ImageFormat, ImageReader};
use image_hasher::{HashAlg, Hasher, HasherConfig};
use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, HashSizeError, IncomparableHashError};

/// Default hash grid edge; 8x8 gives 64-bit tokens.
pub const DEFAULT_HASH_SIZE: u32 = 8;

/// Accepts a grid edge whose `size * size` bits fill whole bytes, i.e. a
/// positive multiple of 4. Token bit length is then exactly `size * size`.
pub fn validate_hash_size(size: u32) -> Result<u32, HashSizeError> {
    if size == 0 || size % 4 != 0 {
        return Err(HashSizeError { size });
    }
    Ok(size)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashKind {
    Average,
    Perceptual,
    Difference,
}

impl HashKind {
    /// Fingerprint order.
    pub const ALL: [HashKind; 3] = [HashKind::Average, HashKind::Perceptual, HashKind::Difference];
}

impl fmt::Display for HashKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Average => write!(f, "aHash"),
            Self::Perceptual => write!(f, "pHash"),
            Self::Difference => write!(f, "dHash"),
        }
    }
}

/// One algorithm's hash bits, rendered as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HashToken(String);

impl HashToken {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let hex = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        Self(hex)
    }

    /// Accepts a hex token of even length; anything else is `None`.
    pub fn parse(token: &str) -> Option<Self> {
        if token.is_empty() || token.len() % 2 != 0 {
            return None;
        }
        if !token.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self(token.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Grid sizes are restricted to whole bytes, so no hex digit is padding.
    pub fn bit_len(&self) -> usize {
        self.0.len() * 4
    }

    fn bytes(&self) -> impl Iterator<Item = u8> + '_ {
        // Constructors guarantee an even number of hex digits.
        self.0
            .as_bytes()
            .chunks(2)
            .map(|pair| u8::from_str_radix(std::str::from_utf8(pair).unwrap_or("00"), 16).unwrap_or(0))
    }

    /// Hamming distance in bits. Tokens of different length are incomparable.
    pub fn distance(&self, other: &HashToken, kind: HashKind) -> Result<u32, IncomparableHashError> {
        if self.bit_len() != other.bit_len() {
            return Err(IncomparableHashError::LengthMismatch {
                kind,
                query_bits: self.bit_len(),
                stored_bits: other.bit_len(),
            });
        }
        Ok(self
            .bytes()
            .zip(other.bytes())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum())
    }
}

impl fmt::Display for HashToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The three perceptual hashes of one image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PerceptualHashes {
    pub average: HashToken,
    pub perceptual: HashToken,
    pub difference: HashToken,
}

impl PerceptualHashes {
    pub fn get(&self, kind: HashKind) -> &HashToken {
        match kind {
            HashKind::Average => &self.average,
            HashKind::Perceptual => &self.perceptual,
            HashKind::Difference => &self.difference,
        }
    }
}

/// An image decoded from disk or memory, with the container format when known.
#[derive(Debug)]
pub struct DecodedImage {
    pub image: DynamicImage,
    pub format: Option<ImageFormat>,
}

/// Computes the three perceptual hashes of an image
pub struct HashComputer {
    average: Hasher,
    perceptual: Hasher,
    difference: Hasher,
    hash_size: u32,
}

impl HashComputer {
    pub fn new() -> Self {
        Self::build(DEFAULT_HASH_SIZE)
    }

    /// Hashes on a `size`x`size` grid. Tokens produced with different sizes
    /// are not comparable with each other.
    pub fn with_hash_size(size: u32) -> Result<Self, HashSizeError> {
        validate_hash_size(size).map(Self::build)
    }

    fn build(size: u32) -> Self {
        Self {
            average: HasherConfig::new()
                .hash_size(size, size)
                .hash_alg(HashAlg::Mean)
                .to_hasher(),
            perceptual: HasherConfig::new()
                .hash_size(size, size)
                .hash_alg(HashAlg::Median)
                .preproc_dct()
                .to_hasher(),
            // Gradient resizes to (size + 1) x size and compares neighbours
            // along each row.
            difference: HasherConfig::new()
                .hash_size(size, size)
                .hash_alg(HashAlg::Gradient)
                .to_hasher(),
            hash_size: size,
        }
    }

    pub fn hash_size(&self) -> u32 {
        self.hash_size
    }

    pub fn compute_hashes(&self, image: &DynamicImage) -> Result<PerceptualHashes, DecodeError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(DecodeError::EmptyImage { width, height });
        }

        // Grayscale, alpha and 16-bit sources are all hashed from 8-bit RGB.
        let rgb;
        let image = match image {
            DynamicImage::ImageRgb8(_) => image,
            other => {
                rgb = DynamicImage::ImageRgb8(other.to_rgb8());
                &rgb
            }
        };

        Ok(PerceptualHashes {
            average: HashToken::from_bytes(self.average.hash_image(image).as_bytes()),
            perceptual: HashToken::from_bytes(self.perceptual.hash_image(image).as_bytes()),
            difference: HashToken::from_bytes(self.difference.hash_image(image).as_bytes()),
        })
    }

    pub fn decode_path(path: &Path) -> Result<DecodedImage, DecodeError> {
        let reader = ImageReader::open(path)?.with_guessed_format()?;
        let format = reader.format();
        let image = reader.decode()?;
        Ok(DecodedImage { image, format })
    }

    pub fn decode_bytes(bytes: &[u8]) -> Result<DecodedImage, DecodeError> {
        let reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
        let format = reader.format();
        let image = reader.decode()?;
        Ok(DecodedImage { image, format })
    }

    /// Exact pixel identity, independent of the perceptual hashes.
    pub fn content_id(image: &DynamicImage) -> String {
        let digest = blake3::hash(image.as_bytes());
        digest.to_hex()[..32].to_string()
    }
}

impl Default for HashComputer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    pub(crate) fn solid_image(color: [u8; 3]) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(100, 100, Rgb(color)))
    }

    /// Deterministic pseudo-random noise.
    pub(crate) fn noise_image(seed: u32) -> DynamicImage {
        let mut state = seed.wrapping_mul(2_654_435_761).max(1);
        DynamicImage::ImageRgb8(RgbImage::from_fn(100, 100, |_, _| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let [r, g, b, _] = state.to_le_bytes();
            Rgb([r, g, b])
        }))
    }

    pub(crate) fn gradient_image() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(100, 100, |x, y| {
            Rgb([(x * 2) as u8, (y * 2) as u8, ((x + y) % 256) as u8])
        }))
    }

    #[test]
    fn test_hashes_are_deterministic() {
        let computer = HashComputer::new();
        let img = noise_image(7);

        let first = computer.compute_hashes(&img).unwrap();
        let second = computer.compute_hashes(&img).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_alpha_and_grayscale_sources_hash_like_rgb() {
        let computer = HashComputer::new();
        let rgb = gradient_image();
        let rgba = DynamicImage::ImageRgba8(rgb.to_rgba8());

        assert_eq!(
            computer.compute_hashes(&rgb).unwrap(),
            computer.compute_hashes(&rgba).unwrap()
        );

        let gray = DynamicImage::ImageLuma8(rgb.to_luma8());
        let as_rgb = DynamicImage::ImageRgb8(gray.to_rgb8());
        assert_eq!(
            computer.compute_hashes(&gray).unwrap(),
            computer.compute_hashes(&as_rgb).unwrap()
        );
    }

    #[test]
    fn test_default_tokens_are_64_bits() {
        let computer = HashComputer::new();
        let hashes = computer.compute_hashes(&gradient_image()).unwrap();

        for kind in HashKind::ALL {
            let token = hashes.get(kind);
            assert_eq!(token.bit_len(), 64, "{kind}");
            assert_eq!(token.as_str().len(), 16);
            assert!(token.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn test_hash_size_must_fill_whole_bytes() {
        for size in [0, 1, 2, 3, 6, 10] {
            assert_eq!(
                HashComputer::with_hash_size(size).err(),
                Some(HashSizeError { size }),
                "size {size}"
            );
        }

        for (size, bits) in [(4, 16), (12, 144), (16, 256)] {
            let computer = HashComputer::with_hash_size(size).unwrap();
            assert_eq!(computer.hash_size(), size);
            let hashes = computer.compute_hashes(&noise_image(1)).unwrap();
            for kind in HashKind::ALL {
                assert_eq!(hashes.get(kind).bit_len(), bits, "{kind} at size {size}");
            }
        }
    }

    #[test]
    fn test_resized_image_stays_close() {
        let computer = HashComputer::new();
        let img = gradient_image();
        let smaller = img.resize_exact(60, 60, image::imageops::FilterType::Triangle);

        let a = computer.compute_hashes(&img).unwrap();
        let b = computer.compute_hashes(&smaller).unwrap();
        let dist = a.average.distance(&b.average, HashKind::Average).unwrap();
        assert!(dist <= 8, "average hash drifted by {dist} bits");
    }

    #[test]
    fn test_empty_image_is_rejected() {
        let computer = HashComputer::new();
        let empty = DynamicImage::new_rgb8(0, 0);

        let err = computer.compute_hashes(&empty).unwrap_err();
        assert!(matches!(err, DecodeError::EmptyImage { width: 0, height: 0 }));
    }

    #[test]
    fn test_decode_bytes_rejects_garbage() {
        let err = HashComputer::decode_bytes(b"definitely not an image").unwrap_err();
        assert!(matches!(err, DecodeError::Image(_)));
    }

    #[test]
    fn test_decode_bytes_reports_format() {
        let mut buf = Vec::new();
        solid_image([0, 0, 255])
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();

        let decoded = HashComputer::decode_bytes(&buf).unwrap();
        assert_eq!(decoded.format, Some(ImageFormat::Png));
        assert_eq!(decoded.image.dimensions(), (100, 100));
    }

    #[test]
    fn test_token_distance() {
        let a = HashToken::parse("ff00").unwrap();
        let b = HashToken::parse("0f00").unwrap();
        assert_eq!(a.distance(&b, HashKind::Average).unwrap(), 4);
        assert_eq!(a.distance(&a, HashKind::Average).unwrap(), 0);

        let long = HashToken::parse("ff00ff00").unwrap();
        let err = a.distance(&long, HashKind::Difference).unwrap_err();
        assert_eq!(
            err,
            IncomparableHashError::LengthMismatch {
                kind: HashKind::Difference,
                query_bits: 16,
                stored_bits: 32,
            }
        );
    }

    #[test]
    fn test_token_parse_rejects_non_hex() {
        assert!(HashToken::parse("").is_none());
        assert!(HashToken::parse("abc").is_none());
        assert!(HashToken::parse("zz").is_none());
        assert_eq!(HashToken::parse("AB").unwrap().as_str(), "ab");
    }

    #[test]
    fn test_content_id_tracks_pixels() {
        let red = solid_image([255, 0, 0]);
        assert_eq!(HashComputer::content_id(&red), HashComputer::content_id(&red.clone()));
        assert_ne!(
            HashComputer::content_id(&red),
            HashComputer::content_id(&solid_image([254, 0, 0]))
        );
        assert_eq!(HashComputer::content_id(&red).len(), 32);
    }
}
