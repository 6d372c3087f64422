//! Subscription document decoding
//!
//! A subscription body is either a Base64-encoded or plaintext
//! newline-delimited list of proxy URIs. Metadata (traffic counters,
//! expiry, refresh interval, support URL) travels in a reserved response
//! header exposed by the HTTP collaborator; this decoder accepts that
//! side-channel value as a second input instead of re-fetching.

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::codec::base64::decode_base64;
use crate::error::DecodeError;
use crate::model::{DEFAULT_UPDATE_INTERVAL_MINUTES, SubscriptionInfo};

/// Result of decoding a subscription document
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionDecodeResult {
    pub info: SubscriptionInfo,
    /// One proxy URI per entry, in source order
    pub uris: Vec<String>,
}

/// Decodes a raw subscription body plus its metadata side channel.
///
/// The whole body is tried as Base64 first (subscription convention); on
/// failure it is treated as plaintext. Blank lines and `#` comment lines
/// are skipped. A body that decodes to zero URIs is not an error here —
/// the sync engine decides whether an empty list is fatal.
pub fn decode(
    body: &[u8],
    metadata_header: Option<&str>,
) -> Result<SubscriptionDecodeResult, DecodeError> {
    if body.is_empty() {
        return Err(DecodeError::EmptyBody);
    }

    let text = std::str::from_utf8(body).map_err(|_| DecodeError::InvalidUtf8)?;

    // Accept a Base64 decode only when the result actually looks like a URI
    // list; otherwise the body is taken as plaintext.
    let decoded = decode_base64(text.trim())
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .filter(|decoded| decoded.lines().any(|line| is_proxy_uri(line.trim())));

    let decoded = match decoded {
        Some(decoded) => {
            debug!(
                "Subscription body decoded from Base64, {} bytes",
                decoded.len()
            );
            decoded
        }
        None => {
            debug!("Subscription body treated as plaintext");
            text.to_string()
        }
    };

    let uris: Vec<String> = decoded
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect();

    debug!("Subscription decoded: {} URI lines", uris.len());

    Ok(SubscriptionDecodeResult {
        info: parse_metadata(metadata_header),
        uris,
    })
}

/// Checks whether a line looks like a proxy URI
fn is_proxy_uri(line: &str) -> bool {
    const SCHEMES: &[&str] = &[
        "ss://",
        "ssr://",
        "vmess://",
        "vless://",
        "trojan://",
        "hysteria://",
        "hysteria2://",
        "hy2://",
        "tuic://",
        "anytls://",
    ];
    SCHEMES.iter().any(|scheme| line.starts_with(scheme))
}

/// Parses the `subscription-userinfo` style header value.
///
/// The value is a `;`-separated list of `key=value` pairs. Recognized keys:
/// `upload`, `download`, `total` (bytes), `expire` (unix seconds), plus the
/// extended keys some providers send: `title`, `interval` (minutes) and
/// `support-url`. Unrecognized keys are ignored.
fn parse_metadata(header: Option<&str>) -> SubscriptionInfo {
    let mut info = SubscriptionInfo::default();
    let Some(header) = header else {
        return info;
    };

    for pair in header.split(';') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();

        match key.as_str() {
            "upload" => info.upload_bytes = value.parse().unwrap_or(0),
            "download" => info.download_bytes = value.parse().unwrap_or(0),
            "total" => info.total_bytes = value.parse().unwrap_or(0),
            "expire" => {
                info.expires_at = value
                    .parse::<i64>()
                    .ok()
                    .filter(|ts| *ts > 0)
                    .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0));
            }
            "title" => {
                if !value.is_empty() {
                    info.title = Some(value.to_string());
                }
            }
            "interval" => {
                info.update_interval_minutes = value
                    .parse::<u32>()
                    .ok()
                    .filter(|m| *m > 0)
                    .unwrap_or(DEFAULT_UPDATE_INTERVAL_MINUTES);
            }
            "support-url" => {
                if !value.is_empty() {
                    info.support_url = Some(value.to_string());
                }
            }
            other => trace!("Ignoring unknown subscription metadata key '{}'", other),
        }
    }

    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::base64::encode_base64;

    #[test]
    fn test_decode_plaintext() {
        let body = "vless://uuid@1.2.3.4:443#a\n\n# comment\ntrojan://pw@5.6.7.8:443#b\n";
        let result = decode(body.as_bytes(), None).unwrap();
        assert_eq!(result.uris.len(), 2);
        assert!(result.uris[0].starts_with("vless://"));
        assert!(result.uris[1].starts_with("trojan://"));
    }

    #[test]
    fn test_decode_base64_body() {
        let plain = "vless://uuid@1.2.3.4:443?security=tls&type=ws&path=/ws#MyServer\n# comment\ntrojan://pw@5.6.7.8:443";
        let body = encode_base64(plain.as_bytes());
        let result = decode(body.as_bytes(), None).unwrap();
        assert_eq!(result.uris.len(), 2);
    }

    #[test]
    fn test_base64_lookalike_without_uris_is_plaintext() {
        // Decodes as Base64 but the result is not a URI list
        let result = decode(b"aGVsbG8gd29ybGQ=", None).unwrap();
        assert_eq!(result.uris, vec!["aGVsbG8gd29ybGQ=".to_string()]);
    }

    #[test]
    fn test_decode_empty_body() {
        assert!(matches!(decode(b"", None), Err(DecodeError::EmptyBody)));
    }

    #[test]
    fn test_decode_invalid_utf8() {
        assert!(matches!(
            decode(&[0xff, 0xfe, 0x00], None),
            Err(DecodeError::InvalidUtf8)
        ));
    }

    #[test]
    fn test_decode_comments_only_yields_empty_list() {
        let result = decode(b"# just a comment\n\n", None).unwrap();
        assert!(result.uris.is_empty());
    }

    #[test]
    fn test_metadata_counters_and_expiry() {
        let header = "upload=1000; download=2000; total=10000; expire=1893456000";
        let result = decode(b"vless://u@h:1#x", Some(header)).unwrap();

        assert_eq!(result.info.upload_bytes, 1000);
        assert_eq!(result.info.download_bytes, 2000);
        assert_eq!(result.info.total_bytes, 10000);
        assert_eq!(result.info.consumed_bytes(), 3000);
        assert_eq!(
            result.info.expires_at,
            DateTime::<Utc>::from_timestamp(1893456000, 0)
        );
    }

    #[test]
    fn test_metadata_extended_keys() {
        let header = "upload=0; download=0; total=0; title=My Provider; interval=120; support-url=https://support.example.com";
        let result = decode(b"vless://u@h:1#x", Some(header)).unwrap();

        assert_eq!(result.info.title.as_deref(), Some("My Provider"));
        assert_eq!(result.info.update_interval_minutes, 120);
        assert_eq!(
            result.info.support_url.as_deref(),
            Some("https://support.example.com")
        );
    }

    #[test]
    fn test_metadata_zero_interval_falls_back_to_default() {
        let result = decode(b"vless://u@h:1#x", Some("interval=0")).unwrap();
        assert_eq!(
            result.info.update_interval_minutes,
            DEFAULT_UPDATE_INTERVAL_MINUTES
        );
    }

    #[test]
    fn test_metadata_absent() {
        let result = decode(b"vless://u@h:1#x", None).unwrap();
        assert_eq!(result.info, SubscriptionInfo::default());
    }

    #[test]
    fn test_metadata_unknown_keys_ignored() {
        let result = decode(b"vless://u@h:1#x", Some("upload=5; frobnicate=9")).unwrap();
        assert_eq!(result.info.upload_bytes, 5);
    }
}
