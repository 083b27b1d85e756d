//! Derived image renditions: size variants, format negotiation, and the
//! conversion engine with its ordered fallback chain.

pub mod engine;
pub mod negotiate;

pub use engine::{ImageIngestError, ImageVariantEngine, SourceImage, VariantImage};

/// A size/quality rendition preset. Presets are fixed and not
/// caller-adjustable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    Thumbnail,
    Medium,
    Full,
    /// Degenerate low-fidelity preview; see [`engine`].
    Placeholder,
}

impl Variant {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "thumbnail" => Some(Self::Thumbnail),
            "medium" => Some(Self::Medium),
            "full" => Some(Self::Full),
            "placeholder" => Some(Self::Placeholder),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Thumbnail => "thumbnail",
            Self::Medium => "medium",
            Self::Full => "full",
            Self::Placeholder => "placeholder",
        }
    }

    /// Target bounding box; `None` means no resize.
    pub fn bounds(&self) -> Option<(u32, u32)> {
        match self {
            Self::Thumbnail => Some((300, 300)),
            Self::Medium => Some((800, 800)),
            Self::Full | Self::Placeholder => None,
        }
    }

    /// Fixed encode quality preset.
    pub fn quality(&self) -> u8 {
        match self {
            Self::Thumbnail => 75,
            Self::Medium => 85,
            Self::Full => 90,
            Self::Placeholder => 30,
        }
    }

    /// Cache lifetime: thumbnails live longest of the real variants, the
    /// placeholder far longer than any of them.
    pub fn cache_ttl_secs(&self) -> u64 {
        match self {
            Self::Thumbnail => 24 * 3600,
            Self::Medium => 12 * 3600,
            Self::Full => 6 * 3600,
            Self::Placeholder => 7 * 24 * 3600,
        }
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A concrete, resolved output format. The negotiable `auto` token lives in
/// [`FormatRequest`] so it can never leak into cache keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    Avif,
    Webp,
    Jpeg,
}

impl OutputFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "avif" => Some(Self::Avif),
            "webp" => Some(Self::Webp),
            "jpeg" | "jpg" => Some(Self::Jpeg),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Avif => "avif",
            Self::Webp => "webp",
            Self::Jpeg => "jpeg",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Avif => "image/avif",
            Self::Webp => "image/webp",
            Self::Jpeg => "image/jpeg",
        }
    }

    /// The fallback cascade starting at this format, best first.
    pub fn cascade(&self) -> &'static [OutputFormat] {
        match self {
            Self::Avif => &[Self::Avif, Self::Webp, Self::Jpeg],
            Self::Webp => &[Self::Webp, Self::Jpeg],
            Self::Jpeg => &[Self::Jpeg],
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A caller's format wish: a concrete format, or `auto` to be resolved via
/// content negotiation ([`negotiate::select_format`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatRequest {
    Auto,
    Explicit(OutputFormat),
}

impl FormatRequest {
    pub fn parse(value: &str) -> Option<Self> {
        if value == "auto" {
            return Some(Self::Auto);
        }
        OutputFormat::parse(value).map(Self::Explicit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_presets() {
        assert_eq!(Variant::Thumbnail.bounds(), Some((300, 300)));
        assert_eq!(Variant::Medium.bounds(), Some((800, 800)));
        assert_eq!(Variant::Full.bounds(), None);
        assert_eq!(Variant::Thumbnail.quality(), 75);
        assert_eq!(Variant::Medium.quality(), 85);
        assert_eq!(Variant::Full.quality(), 90);
    }

    #[test]
    fn placeholder_outlives_real_variants() {
        let placeholder = Variant::Placeholder.cache_ttl_secs();
        for variant in [Variant::Thumbnail, Variant::Medium, Variant::Full] {
            assert!(placeholder > variant.cache_ttl_secs());
        }
    }

    #[test]
    fn cascade_always_ends_at_jpeg() {
        for format in [OutputFormat::Avif, OutputFormat::Webp, OutputFormat::Jpeg] {
            assert_eq!(format.cascade().last(), Some(&OutputFormat::Jpeg));
            assert_eq!(format.cascade().first(), Some(&format));
        }
    }

    #[test]
    fn format_request_parses_auto_and_aliases() {
        assert_eq!(FormatRequest::parse("auto"), Some(FormatRequest::Auto));
        assert_eq!(
            FormatRequest::parse("jpg"),
            Some(FormatRequest::Explicit(OutputFormat::Jpeg))
        );
        assert_eq!(FormatRequest::parse("bmp"), None);
    }
}
