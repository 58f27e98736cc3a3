//! Deterministic job fingerprints.

use sha2::{Digest, Sha256};
use std::fmt;

use crate::config::ConversionConfig;
use crate::image::ImagePayload;

/// Deterministic key derived from image content and configuration.
///
/// Used for cache lookup and in-flight dedup: byte-identical pixels and a
/// structurally equal config always produce the same fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the fingerprint of an (image, config) pair.
    pub fn compute(image: &ImagePayload, config: &ConversionConfig) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(image.width().to_le_bytes());
        hasher.update(image.height().to_le_bytes());
        hasher.update(image.pixels());
        hasher.update(config.canonical_json().as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TraceBackend;

    fn image(fill: u8) -> ImagePayload {
        ImagePayload::new(2, 2, vec![fill; 16]).unwrap()
    }

    #[test]
    fn identical_inputs_share_a_fingerprint() {
        let config = ConversionConfig::default();
        let a = Fingerprint::compute(&image(7), &config);
        let b = Fingerprint::compute(&image(7), &config);
        assert_eq!(a, b);
    }

    #[test]
    fn pixel_change_changes_fingerprint() {
        let config = ConversionConfig::default();
        assert_ne!(
            Fingerprint::compute(&image(7), &config),
            Fingerprint::compute(&image(8), &config)
        );
    }

    #[test]
    fn config_change_changes_fingerprint() {
        let img = image(7);
        assert_ne!(
            Fingerprint::compute(&img, &ConversionConfig::new(TraceBackend::Edge)),
            Fingerprint::compute(&img, &ConversionConfig::new(TraceBackend::Dots))
        );
    }
}
