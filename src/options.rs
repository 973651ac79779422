//! Processing Options and content-addressed Fingerprint (spec §3).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TargetFormat {
    Png,
    Jpeg,
    Webp,
    Gif,
    Bmp,
    Tiff,
    Ico,
}

impl TargetFormat {
    pub fn as_image_format(self) -> image::ImageFormat {
        match self {
            TargetFormat::Png => image::ImageFormat::Png,
            TargetFormat::Jpeg => image::ImageFormat::Jpeg,
            TargetFormat::Webp => image::ImageFormat::WebP,
            TargetFormat::Gif => image::ImageFormat::Gif,
            TargetFormat::Bmp => image::ImageFormat::Bmp,
            TargetFormat::Tiff => image::ImageFormat::Tiff,
            TargetFormat::Ico => image::ImageFormat::Ico,
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            TargetFormat::Png => "image/png",
            TargetFormat::Jpeg => "image/jpeg",
            TargetFormat::Webp => "image/webp",
            TargetFormat::Gif => "image/gif",
            TargetFormat::Bmp => "image/bmp",
            TargetFormat::Tiff => "image/tiff",
            TargetFormat::Ico => "image/x-icon",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationAngle {
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Default for RotationAngle {
    fn default() -> Self {
        RotationAngle::Deg0
    }
}

fn default_quality() -> u8 {
    85
}

const fn is_default_quality(q: &u8) -> bool {
    *q == 85
}

fn default_true() -> bool {
    true
}

const fn is_true(b: &bool) -> bool {
    *b
}

const fn is_false(b: &bool) -> bool {
    !*b
}

const fn is_default_rotation(r: &RotationAngle) -> bool {
    matches!(r, RotationAngle::Deg0)
}

/// A fixed, strongly-typed option record (spec §3, §9 "Dynamic
/// processing-options dictionary" redesign). Unknown keys at the JSON edge
/// are ignored with a warning rather than rejected (see `http::multipart`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ProcessingOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resize_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resize_height: Option<u32>,
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub maintain_aspect_ratio: bool,
    #[serde(default = "default_quality", skip_serializing_if = "is_default_quality")]
    pub quality: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_format: Option<TargetFormat>,
    #[serde(default, skip_serializing_if = "is_default_rotation")]
    pub rotation_angle: RotationAngle,
    #[serde(default, skip_serializing_if = "is_false")]
    pub flip_horizontal: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub flip_vertical: bool,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        ProcessingOptions {
            resize_width: None,
            resize_height: None,
            maintain_aspect_ratio: true,
            quality: default_quality(),
            target_format: None,
            rotation_angle: RotationAngle::Deg0,
            flip_horizontal: false,
            flip_vertical: false,
        }
    }
}

impl ProcessingOptions {
    /// Validate field ranges per spec §3. `resize_width = Some(0)` and
    /// similar zero values are treated as "unset" so they canonicalize to
    /// the same fingerprint as omission (spec §8 "Options canonicalization").
    pub fn normalized(&self) -> ProcessingOptions {
        let mut out = self.clone();
        if out.resize_width == Some(0) {
            out.resize_width = None;
        }
        if out.resize_height == Some(0) {
            out.resize_height = None;
        }
        out
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(1..=100).contains(&self.quality) {
            return Err(format!("quality must be 1-100, got {}", self.quality));
        }
        Ok(())
    }

    /// Canonical bytes used as the options half of the Fingerprint input.
    /// Normalization (default-valued fields omitted) makes semantically
    /// equivalent options serialize identically.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.normalized()).expect("ProcessingOptions always serializes")
    }
}

/// Cache key: SHA-256 over `(content_hash(file_bytes), canonical(options))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn compute(file_bytes: &[u8], options: &ProcessingOptions) -> Self {
        let mut content_hasher = Sha256::new();
        content_hasher.update(file_bytes);
        let content_hash = content_hasher.finalize();

        let mut hasher = Sha256::new();
        hasher.update(content_hash);
        hasher.update(options.canonical_bytes());
        let digest = hasher.finalize();

        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Fingerprint(bytes)
    }

    pub fn to_hex(self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}
