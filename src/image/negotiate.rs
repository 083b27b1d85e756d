//! Content negotiation for the `auto` format token.
//!
//! Resolution order is avif > webp > jpeg, gated on the Accept header.
//! AVIF is only offered to user agents known to decode it: Safari gained
//! support in 16.1, so older Safari is excluded even when its Accept header
//! advertises the type.

use super::OutputFormat;

/// Resolve `auto` to a concrete format from request headers.
pub fn select_format(accept: &str, user_agent: &str) -> OutputFormat {
    let ua = user_agent.to_ascii_lowercase();

    if accept.contains("image/avif") && avif_capable(&ua) {
        return OutputFormat::Avif;
    }

    if accept.contains("image/webp") {
        return OutputFormat::Webp;
    }

    OutputFormat::Jpeg
}

fn avif_capable(ua: &str) -> bool {
    // Chrome reports "safari" in its UA string; real Safari does not report
    // "chrome".
    if ua.contains("safari") && !ua.contains("chrome") {
        return matches!(safari_version(ua), Some((major, minor)) if major > 16 || (major == 16 && minor >= 1));
    }
    !ua.contains("safari")
}

/// Extract `Version/<major>.<minor>` from a Safari user-agent string.
fn safari_version(ua: &str) -> Option<(u32, u32)> {
    let rest = &ua[ua.find("version/")? + "version/".len()..];
    let mut parts = rest
        .split(|c: char| !c.is_ascii_digit())
        .filter(|part| !part.is_empty());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().and_then(|part| part.parse().ok()).unwrap_or(0);
    Some((major, minor))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACCEPT_ALL: &str = "image/avif,image/webp,image/*,*/*;q=0.8";
    const ACCEPT_WEBP: &str = "image/webp,image/*,*/*;q=0.8";

    const CHROME_UA: &str =
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";
    const FIREFOX_UA: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0";
    const OLD_SAFARI_UA: &str =
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/15.6 Safari/605.1.15";
    const NEW_SAFARI_UA: &str =
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.1 Safari/605.1.15";

    #[test]
    fn avif_for_chrome_and_firefox() {
        assert_eq!(select_format(ACCEPT_ALL, CHROME_UA), OutputFormat::Avif);
        assert_eq!(select_format(ACCEPT_ALL, FIREFOX_UA), OutputFormat::Avif);
    }

    #[test]
    fn old_safari_is_held_back_to_webp() {
        assert_eq!(select_format(ACCEPT_ALL, OLD_SAFARI_UA), OutputFormat::Webp);
    }

    #[test]
    fn safari_16_1_gets_avif() {
        assert_eq!(select_format(ACCEPT_ALL, NEW_SAFARI_UA), OutputFormat::Avif);
    }

    #[test]
    fn webp_without_avif_in_accept() {
        assert_eq!(select_format(ACCEPT_WEBP, CHROME_UA), OutputFormat::Webp);
    }

    #[test]
    fn jpeg_when_nothing_is_advertised() {
        assert_eq!(select_format("*/*", CHROME_UA), OutputFormat::Jpeg);
        assert_eq!(select_format("", ""), OutputFormat::Jpeg);
    }

    #[test]
    fn safari_version_parses_major_minor() {
        assert_eq!(
            safari_version(&OLD_SAFARI_UA.to_ascii_lowercase()),
            Some((15, 6))
        );
        assert_eq!(
            safari_version(&NEW_SAFARI_UA.to_ascii_lowercase()),
            Some((16, 1))
        );
        assert_eq!(safari_version("no version token"), None);
    }
}
