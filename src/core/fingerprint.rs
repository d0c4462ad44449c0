use image_hasher::{HashAlg, HasherConfig};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
}

/// Fixed-length perceptual fingerprint, compared by Hamming distance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PerceptualHash(Vec<u8>);

impl PerceptualHash {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn bit_len(&self) -> u32 {
        self.0.len() as u32 * 8
    }

    /// Count of differing bits. Both hashes must come from the same hash kind
    /// and configuration; comparing across widths is a caller bug.
    pub fn distance(&self, other: &PerceptualHash) -> u32 {
        debug_assert_eq!(self.0.len(), other.0.len());
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }

    pub fn to_hex(&self) -> String {
        use std::fmt::Write;
        let mut out = String::with_capacity(self.0.len() * 2);
        for byte in &self.0 {
            let _ = write!(out, "{:02x}", byte);
        }
        out
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() % 2 != 0 {
            return None;
        }
        let bytes: Option<Vec<u8>> = (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
            .collect();
        bytes.map(Self)
    }
}

/// The three fingerprints computed for one thumbnail.
#[derive(Debug, Clone)]
pub struct Fingerprints {
    /// SHA-256 hex over the raw byte stream; equal only for identical bytes.
    pub content_hash: String,
    /// DCT/mean hash, robust to resizing and recompression.
    pub phash: PerceptualHash,
    /// Gradient hash, cheap and independent of the DCT hash.
    pub dhash: PerceptualHash,
}

/// Computes content and perceptual fingerprints from raw image bytes.
/// Pure and deterministic: identical bytes always yield identical output.
pub struct Fingerprinter {
    hash_size: u32,
}

impl Fingerprinter {
    pub fn new(hash_size: u32) -> Self {
        Self { hash_size }
    }

    pub fn compute(&self, bytes: &[u8]) -> Result<Fingerprints, FingerprintError> {
        let img = image::load_from_memory(bytes)?;

        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let content_hash = format!("{:x}", hasher.finalize());

        let phash = HasherConfig::new()
            .hash_size(self.hash_size, self.hash_size)
            .preproc_dct()
            .hash_alg(HashAlg::Mean)
            .to_hasher()
            .hash_image(&img);

        let dhash = HasherConfig::new()
            .hash_size(self.hash_size, self.hash_size)
            .hash_alg(HashAlg::Gradient)
            .to_hasher()
            .hash_image(&img);

        Ok(Fingerprints {
            content_hash,
            phash: PerceptualHash::from_bytes(phash.as_bytes().to_vec()),
            dhash: PerceptualHash::from_bytes(dhash.as_bytes().to_vec()),
        })
    }
}
