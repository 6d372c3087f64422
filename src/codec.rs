//! Proxy URI codec
//!
//! Parses single proxy-server URIs (vless://, vmess://, trojan://, ss://)
//! into the canonical [`ParsedServer`] representation and serializes them
//! back for export/share flows. Each protocol codec implements the
//! [`ProtocolCodec`] trait and is dispatched by URI scheme; there is no
//! cross-protocol content sniffing — a vmess body that is not a valid URI
//! is retried as base64 JSON, but only inside the vmess codec.

pub mod base64;
mod shadowsocks;
mod trojan;
mod vless;
mod vmess;

pub use shadowsocks::ShadowsocksCodec;
pub use trojan::TrojanCodec;
pub use vless::VlessCodec;
pub use vmess::VmessCodec;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, warn};
use url::Url;

use crate::error::ParseError;
use crate::model::{ParsedServer, ProtocolConfig};

/// Schemes we recognize as proxy URIs but have no structured codec for.
/// These parse into [`ProtocolConfig::Opaque`] so re-syncing a subscription
/// never silently drops them.
const OPAQUE_SCHEMES: &[&str] = &["hysteria", "hysteria2", "hy2", "tuic", "ssr", "anytls"];

// ============================================================================
// Protocol Codec Trait
// ============================================================================

/// Codec for a single proxy protocol URI scheme
pub trait ProtocolCodec: Send + Sync {
    /// The URI scheme this codec handles (e.g. "ss", "vmess")
    fn scheme(&self) -> &str;

    /// Parses a URI string into a canonical server description
    fn parse(&self, uri: &str) -> Result<ParsedServer, ParseError>;
}

// ============================================================================
// Codec Registry
// ============================================================================

/// Outcome of parsing a batch of URIs. Individual failures never abort the
/// batch; callers report the failure count without losing the successes.
#[derive(Debug, Default)]
pub struct ParseReport {
    pub servers: Vec<ParsedServer>,
    pub failures: Vec<(String, ParseError)>,
}

/// Registry of protocol codecs with scheme-based dispatch
pub struct UriCodec {
    codecs: HashMap<String, Arc<dyn ProtocolCodec>>,
}

impl Default for UriCodec {
    fn default() -> Self {
        Self::with_builtin_codecs()
    }
}

impl UriCodec {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Creates a registry with all built-in codecs registered
    pub fn with_builtin_codecs() -> Self {
        let mut codec = Self::new();
        codec.register(Arc::new(VlessCodec));
        codec.register(Arc::new(VmessCodec));
        codec.register(Arc::new(TrojanCodec));
        codec.register(Arc::new(ShadowsocksCodec));
        codec
    }

    /// Registers a protocol codec
    pub fn register(&mut self, codec: Arc<dyn ProtocolCodec>) {
        self.codecs.insert(codec.scheme().to_string(), codec);
    }

    /// Parses a single URI, dispatching on its scheme
    pub fn parse(&self, uri: &str) -> Result<ParsedServer, ParseError> {
        let uri = uri.trim();
        let scheme = extract_scheme(uri)?;
        debug!("Parsing URI with scheme '{}'", scheme);

        if let Some(codec) = self.codecs.get(scheme) {
            return codec.parse(uri);
        }

        if OPAQUE_SCHEMES.contains(&scheme) {
            return Ok(parse_opaque(uri, scheme));
        }

        Err(ParseError::UnsupportedScheme(scheme.to_string()))
    }

    /// Parses a batch of URI lines, collecting successes and failures
    pub fn parse_all<'a, I>(&self, uris: I) -> ParseReport
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut report = ParseReport::default();
        for uri in uris {
            match self.parse(uri) {
                Ok(server) => report.servers.push(server),
                Err(e) => {
                    warn!("Failed to parse URI: {}", e);
                    report.failures.push((uri.to_string(), e));
                }
            }
        }
        debug!(
            "URI batch parsing complete: {} successful, {} failed",
            report.servers.len(),
            report.failures.len()
        );
        report
    }
}

// ============================================================================
// Serialization
// ============================================================================

/// Serializes a parsed server back to a shareable URI.
///
/// The output is not byte-identical to the original input, but re-parsing
/// it yields a semantically equal [`ParsedServer`].
pub fn serialize(server: &ParsedServer) -> String {
    match &server.config {
        ProtocolConfig::Vless { .. } => vless::serialize(server),
        ProtocolConfig::Vmess { .. } => vmess::serialize(server),
        ProtocolConfig::Trojan { .. } => trojan::serialize(server),
        ProtocolConfig::Shadowsocks { .. } => shadowsocks::serialize(server),
        // The original URI is the only faithful representation we have
        ProtocolConfig::Opaque { .. } => server.raw_uri.clone(),
    }
}

// ============================================================================
// Shared Helpers
// ============================================================================

/// Extracts the scheme from a URI
fn extract_scheme(uri: &str) -> Result<&str, ParseError> {
    if !uri.contains("://") {
        return Err(ParseError::MalformedUri(
            "missing scheme separator ://".to_string(),
        ));
    }
    uri.split("://")
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ParseError::MalformedUri("missing scheme".to_string()))
}

/// Parses a proxy URI with a known-but-unstructured scheme into an opaque
/// server, keeping the authority for display purposes when there is one.
///
/// Retention is best-effort and never fails: ssr:// links carry a Base64
/// body with no URI authority at all, so a missing host or port degrades
/// to placeholders instead of dropping the entry from sync.
fn parse_opaque(uri: &str, scheme: &str) -> ParsedServer {
    let authority = Url::parse(uri).ok().and_then(|url| {
        let address = url.host_str()?.to_string();
        let port = url.port().filter(|p| *p > 0)?;
        let name = display_name(url.fragment(), &address, port);
        Some((name, address, port))
    });

    let (name, address, port) =
        authority.unwrap_or_else(|| (scheme.to_string(), String::new(), 0));

    ParsedServer {
        name,
        raw_uri: uri.to_string(),
        address,
        port,
        config: ProtocolConfig::Opaque {
            scheme: scheme.to_string(),
        },
    }
}

/// Validates that a port is present and non-zero
pub(crate) fn require_port(port: Option<u16>) -> Result<u16, ParseError> {
    match port {
        Some(p) if p > 0 => Ok(p),
        _ => Err(ParseError::InvalidPort),
    }
}

/// Display name from the URI fragment, falling back to `host:port`
pub(crate) fn display_name(fragment: Option<&str>, address: &str, port: u16) -> String {
    fragment
        .filter(|f| !f.is_empty())
        .map(|f| {
            urlencoding::decode(f)
                .unwrap_or_else(|_| f.into())
                .into_owned()
        })
        .unwrap_or_else(|| format!("{}:{}", address, port))
}

/// Splits query pairs into known canonical fields and an `extra` bucket.
///
/// `known` receives the value for each canonical key it asks for; every key
/// not in the canonical set is preserved verbatim for forward compatibility.
pub(crate) fn split_query(
    url: &Url,
    canonical_keys: &[&str],
) -> (HashMap<String, String>, BTreeMap<String, String>) {
    let mut known = HashMap::new();
    let mut extra = BTreeMap::new();
    for (key, value) in url.query_pairs() {
        let key = key.into_owned();
        let value = value.into_owned();
        if canonical_keys.contains(&key.as_str()) {
            known.insert(key, value);
        } else {
            extra.insert(key, value);
        }
    }
    (known, extra)
}

/// Builds a query string from ordered key/value pairs, percent-encoding
/// values. Returns an empty string when there are no pairs.
pub(crate) fn build_query(pairs: &[(&str, String)]) -> String {
    if pairs.is_empty() {
        return String::new();
    }
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in pairs {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}

/// Formats an address for URI output, bracketing IPv6 literals
pub(crate) fn format_host(address: &str) -> String {
    if address.contains(':') && !address.starts_with('[') {
        format!("[{}]", address)
    } else {
        address.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_scheme() {
        assert_eq!(extract_scheme("ss://example").unwrap(), "ss");
        assert_eq!(extract_scheme("vmess://example").unwrap(), "vmess");
        assert!(extract_scheme("invalid").is_err());
        assert!(extract_scheme("://host").is_err());
    }

    #[test]
    fn test_unsupported_scheme() {
        let codec = UriCodec::with_builtin_codecs();
        let err = codec.parse("gopher://host:70").unwrap_err();
        assert!(matches!(err, ParseError::UnsupportedScheme(s) if s == "gopher"));
    }

    #[test]
    fn test_opaque_scheme_retained() {
        let codec = UriCodec::with_builtin_codecs();
        let uri = "hysteria2://password@server.com:443?sni=sni.com#Hy2";
        let server = codec.parse(uri).unwrap();

        assert_eq!(server.address, "server.com");
        assert_eq!(server.port, 443);
        assert_eq!(server.name, "Hy2");
        assert_eq!(server.raw_uri, uri);
        assert!(matches!(
            &server.config,
            ProtocolConfig::Opaque { scheme } if scheme == "hysteria2"
        ));

        // Serialization of an opaque server is the original URI
        assert_eq!(serialize(&server), uri);
    }

    #[test]
    fn test_opaque_without_authority_retained() {
        let codec = UriCodec::with_builtin_codecs();
        // ssr links are a Base64 body, not host:port form
        let uri = "ssr://c2VydmVyLmNvbTo0NDM6b3JpZ2luOmFlcy0yNTYtY2ZiOnBsYWluOmNHRnpjdw";
        let server = codec.parse(uri).unwrap();

        assert_eq!(server.raw_uri, uri);
        assert!(matches!(
            &server.config,
            ProtocolConfig::Opaque { scheme } if scheme == "ssr"
        ));
        // No authority to derive a name or port from
        assert_eq!(server.port, 0);
        assert_eq!(serialize(&server), uri);
    }

    #[test]
    fn test_parse_all_isolates_failures() {
        let codec = UriCodec::with_builtin_codecs();
        let lines = [
            "vless://uuid@1.2.3.4:443?security=tls#ok",
            "garbage-line",
            "trojan://pw@5.6.7.8:443#ok2",
        ];
        let report = codec.parse_all(lines);
        assert_eq!(report.servers.len(), 2);
        assert_eq!(report.failures.len(), 1);
    }

    #[test]
    fn test_display_name_fallback() {
        assert_eq!(display_name(None, "host", 443), "host:443");
        assert_eq!(display_name(Some(""), "host", 443), "host:443");
        assert_eq!(display_name(Some("My%20Server"), "host", 443), "My Server");
    }

    #[test]
    fn test_require_port() {
        assert_eq!(require_port(Some(443)).unwrap(), 443);
        assert!(require_port(Some(0)).is_err());
        assert!(require_port(None).is_err());
    }

    #[test]
    fn test_format_host_ipv6() {
        assert_eq!(format_host("::1"), "[::1]");
        assert_eq!(format_host("example.com"), "example.com");
    }
}
