//! Validator: the admission gate every file must pass before scheduling
//! (spec §4.2).

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    None,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub safe: bool,
    pub threat_level: ThreatLevel,
    pub warnings: Vec<String>,
    pub detected_mime: Option<String>,
    pub detected_format: Option<String>,
    /// Present when `safe == false`; stable reason code for the scheduler to surface.
    pub rejection_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub max_file_size_bytes: u64,
    pub allowed_mime_types: Vec<String>,
    pub deep_scan_enabled: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        ValidatorConfig {
            max_file_size_bytes: 10 * 1024 * 1024,
            allowed_mime_types: vec![
                "image/png".into(),
                "image/jpeg".into(),
                "image/webp".into(),
                "image/gif".into(),
                "image/bmp".into(),
                "image/tiff".into(),
                "image/x-icon".into(),
            ],
            deep_scan_enabled: true,
        }
    }
}

/// Magic-byte sniff table. Each entry: (mime, signature bytes to match at offset 0).
const MAGIC_SIGNATURES: &[(&str, &[u8])] = &[
    ("image/png", &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]),
    ("image/jpeg", &[0xFF, 0xD8, 0xFF]),
    ("image/gif", b"GIF8"),
    ("image/bmp", b"BM"),
    ("image/x-icon", &[0x00, 0x00, 0x01, 0x00]),
];

fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    for (mime, sig) in MAGIC_SIGNATURES {
        if bytes.len() >= sig.len() && &bytes[..sig.len()] == *sig {
            return Some(mime);
        }
    }
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    if bytes.len() >= 4
        && (&bytes[0..4] == b"II*\0" || &bytes[0..4] == b"MM\0*")
    {
        return Some("image/tiff");
    }
    None
}

pub struct Validator {
    config: ValidatorConfig,
}

impl Validator {
    pub fn new(config: ValidatorConfig) -> Self {
        Validator { config }
    }

    /// Run the admission checks in order, short-circuiting on the first
    /// failure (spec §4.2 "Checks, in order").
    pub fn validate(&self, bytes: &[u8], declared_mime: Option<&str>) -> ValidationResult {
        let mut warnings = Vec::new();

        if bytes.len() as u64 > self.config.max_file_size_bytes {
            return ValidationResult {
                safe: false,
                threat_level: ThreatLevel::Medium,
                warnings,
                detected_mime: None,
                detected_format: None,
                rejection_reason: Some("FILE_TOO_LARGE".into()),
            };
        }

        let detected_mime = sniff_mime(bytes);

        let effective_mime = declared_mime.or(detected_mime);
        let mime_allowed = effective_mime
            .map(|m| self.config.allowed_mime_types.iter().any(|a| a == m))
            .unwrap_or(false);
        if !mime_allowed {
            return ValidationResult {
                safe: false,
                threat_level: ThreatLevel::High,
                warnings,
                detected_mime: detected_mime.map(str::to_string),
                detected_format: None,
                rejection_reason: Some("UNSUPPORTED_FORMAT".into()),
            };
        }

        if let (Some(declared), Some(detected)) = (declared_mime, detected_mime) {
            if declared != detected {
                // Header byte signature must match the declared type
                // (spec §4.2 check 3); this short-circuits like every other
                // admission check rather than merely warning.
                return ValidationResult {
                    safe: false,
                    threat_level: ThreatLevel::High,
                    warnings,
                    detected_mime: Some(detected.to_string()),
                    detected_format: None,
                    rejection_reason: Some("SECURITY_REJECTED".into()),
                };
            }
        } else if detected_mime.is_none() {
            return ValidationResult {
                safe: false,
                threat_level: ThreatLevel::High,
                warnings,
                detected_mime: None,
                detected_format: None,
                rejection_reason: Some("SECURITY_REJECTED".into()),
            };
        }

        let mut detected_format = None;
        if self.config.deep_scan_enabled {
            match crate::codec::probe(bytes) {
                Ok(meta) => detected_format = Some(meta.original_format),
                Err(_) => {
                    return ValidationResult {
                        safe: false,
                        threat_level: ThreatLevel::High,
                        warnings,
                        detected_mime: detected_mime.map(str::to_string),
                        detected_format: None,
                        rejection_reason: Some("SECURITY_REJECTED".into()),
                    };
                }
            }
        }

        ValidationResult {
            safe: true,
            threat_level: ThreatLevel::None,
            warnings,
            detected_mime: detected_mime.map(str::to_string),
            detected_format,
            rejection_reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_png_bytes() -> Vec<u8> {
        let img = image::DynamicImage::new_rgb8(2, 2);
        let mut out = Vec::new();
        img.write_to(
            &mut std::io::Cursor::new(&mut out),
            image::ImageFormat::Png,
        )
        .unwrap();
        out
    }

    #[test]
    fn valid_png_passes() {
        let v = Validator::new(ValidatorConfig::default());
        let result = v.validate(&tiny_png_bytes(), Some("image/png"));
        assert!(result.safe);
    }

    #[test]
    fn oversized_file_is_rejected() {
        let mut config = ValidatorConfig::default();
        config.max_file_size_bytes = 4;
        let v = Validator::new(config);
        let result = v.validate(&tiny_png_bytes(), Some("image/png"));
        assert!(!result.safe);
        assert_eq!(result.rejection_reason.as_deref(), Some("FILE_TOO_LARGE"));
    }

    #[test]
    fn file_exactly_at_limit_is_accepted() {
        let bytes = tiny_png_bytes();
        let mut config = ValidatorConfig::default();
        config.max_file_size_bytes = bytes.len() as u64;
        let v = Validator::new(config);
        assert!(v.validate(&bytes, Some("image/png")).safe);
    }

    #[test]
    fn one_byte_over_limit_is_rejected() {
        let bytes = tiny_png_bytes();
        let mut config = ValidatorConfig::default();
        config.max_file_size_bytes = bytes.len() as u64 - 1;
        let v = Validator::new(config);
        assert!(!v.validate(&bytes, Some("image/png")).safe);
    }

    #[test]
    fn unsupported_mime_is_rejected() {
        let v = Validator::new(ValidatorConfig::default());
        let result = v.validate(b"not an image at all", Some("application/zip"));
        assert!(!result.safe);
        assert_eq!(
            result.rejection_reason.as_deref(),
            Some("UNSUPPORTED_FORMAT")
        );
    }

    #[test]
    fn corrupt_bytes_with_matching_declared_mime_fail_deep_scan() {
        let v = Validator::new(ValidatorConfig::default());
        // Not a real PNG, but declares image/png; short-circuits before magic sniff matters.
        let result = v.validate(b"\x89PNGxxxxgarbage", Some("image/png"));
        assert!(!result.safe);
    }

    #[test]
    fn declared_mime_mismatching_header_signature_is_rejected() {
        let v = Validator::new(ValidatorConfig::default());
        // Real JPEG header bytes, but declares PNG.
        let jpeg_header = [0xFF, 0xD8, 0xFF, 0xE0, 0, 0, 0, 0];
        let result = v.validate(&jpeg_header, Some("image/png"));
        assert!(!result.safe);
        assert_eq!(result.rejection_reason.as_deref(), Some("SECURITY_REJECTED"));
        assert_eq!(result.detected_mime.as_deref(), Some("image/jpeg"));
    }
}
