//! Shadowsocks protocol codec
//!
//! Supports both SIP002 and the legacy form:
//! - SIP002: ss://BASE64(method:password)@host:port#name
//! - SIP002 with plain userinfo: ss://method:password@host:port#name
//! - Legacy: ss://BASE64(method:password@host:port)#name

use std::collections::BTreeMap;

use tracing::trace;

use crate::error::ParseError;
use crate::model::{ParsedServer, ProtocolConfig};

use super::base64::{decode_base64_str, encode_base64};
use super::{ProtocolCodec, build_query, format_host};

pub struct ShadowsocksCodec;

impl ProtocolCodec for ShadowsocksCodec {
    fn scheme(&self) -> &str {
        "ss"
    }

    fn parse(&self, uri: &str) -> Result<ParsedServer, ParseError> {
        let uri = uri.trim();
        trace!("Parsing Shadowsocks URI");

        let without_scheme = uri
            .strip_prefix("ss://")
            .ok_or_else(|| ParseError::MalformedUri("missing ss:// prefix".to_string()))?;

        // Fragment holds the display name
        let (main_part, name) = match without_scheme.rfind('#') {
            Some(pos) => {
                let fragment = &without_scheme[pos + 1..];
                let name = urlencoding::decode(fragment)
                    .unwrap_or_else(|_| fragment.into())
                    .into_owned();
                (&without_scheme[..pos], Some(name))
            }
            None => (without_scheme, None),
        };

        // Query (SIP003 plugin and friends) precedes the fragment
        let (main_part, query) = match main_part.find('?') {
            Some(pos) => (&main_part[..pos], Some(&main_part[pos + 1..])),
            None => (main_part, None),
        };

        let (mut plugin, mut extra) = (None, BTreeMap::new());
        if let Some(query) = query {
            for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
                if key == "plugin" {
                    plugin = Some(value.into_owned());
                } else {
                    extra.insert(key.into_owned(), value.into_owned());
                }
            }
        }

        let (method, password, address, port) = match main_part.rfind('@') {
            Some(at_pos) => {
                trace!("Parsing as SIP002 format (found @ separator)");
                let (method, password) = parse_userinfo(&main_part[..at_pos])?;
                let (address, port) = parse_host_port(&main_part[at_pos + 1..])?;
                (method, password, address, port)
            }
            None => {
                trace!("Parsing as legacy Base64 format");
                parse_legacy(main_part)?
            }
        };

        let name = name.unwrap_or_else(|| format!("{}:{}", address, port));

        Ok(ParsedServer {
            name,
            raw_uri: uri.to_string(),
            address,
            port,
            config: ProtocolConfig::Shadowsocks {
                method,
                password,
                plugin,
                extra,
            },
        })
    }
}

/// Legacy format: the whole body is BASE64(method:password@host:port)
fn parse_legacy(main_part: &str) -> Result<(String, String, String, u16), ParseError> {
    let decoded = decode_base64_str(main_part).ok_or_else(|| {
        ParseError::MalformedCredential("legacy Shadowsocks body is not Base64".to_string())
    })?;

    let at_pos = decoded.rfind('@').ok_or_else(|| {
        ParseError::MalformedCredential("legacy Shadowsocks format missing @".to_string())
    })?;

    let (method, password) = split_method_password(&decoded[..at_pos])?;
    let (address, port) = parse_host_port(&decoded[at_pos + 1..])?;
    Ok((method, password, address, port))
}

/// Userinfo is either BASE64(method:password) or plain method:password
fn parse_userinfo(userinfo: &str) -> Result<(String, String), ParseError> {
    if let Some(decoded) = decode_base64_str(userinfo)
        && decoded.contains(':')
    {
        return split_method_password(&decoded);
    }

    let decoded = urlencoding::decode(userinfo)
        .unwrap_or_else(|_| userinfo.into())
        .into_owned();
    split_method_password(&decoded)
}

fn split_method_password(s: &str) -> Result<(String, String), ParseError> {
    let colon_pos = s.find(':').ok_or_else(|| {
        ParseError::MalformedCredential("missing method:password separator".to_string())
    })?;
    Ok((s[..colon_pos].to_string(), s[colon_pos + 1..].to_string()))
}

/// Parses host:port, handling IPv6 addresses in brackets
fn parse_host_port(hostport: &str) -> Result<(String, u16), ParseError> {
    if hostport.starts_with('[') {
        let bracket_end = hostport
            .find(']')
            .ok_or_else(|| ParseError::MalformedUri("unclosed IPv6 bracket".to_string()))?;

        let host = hostport[..=bracket_end].to_string();
        let port_str = hostport
            .get(bracket_end + 2..)
            .ok_or(ParseError::InvalidPort)?;
        let port: u16 = port_str.parse().map_err(|_| ParseError::InvalidPort)?;
        return super::require_port(Some(port)).map(|p| (host, p));
    }

    let colon_pos = hostport.rfind(':').ok_or(ParseError::InvalidPort)?;
    let host = hostport[..colon_pos].to_string();
    if host.is_empty() {
        return Err(ParseError::MalformedUri("missing host".to_string()));
    }
    let port: u16 = hostport[colon_pos + 1..]
        .parse()
        .map_err(|_| ParseError::InvalidPort)?;
    super::require_port(Some(port)).map(|p| (host, p))
}

/// Serializes a Shadowsocks server to SIP002 form
pub(super) fn serialize(server: &ParsedServer) -> String {
    let ProtocolConfig::Shadowsocks {
        method,
        password,
        plugin,
        extra,
    } = &server.config
    else {
        unreachable!("serialize dispatched on variant");
    };

    let userinfo = encode_base64(format!("{}:{}", method, password).as_bytes());

    let mut pairs: Vec<(&str, String)> = Vec::new();
    if let Some(plugin) = plugin {
        pairs.push(("plugin", plugin.clone()));
    }
    for (key, value) in extra {
        pairs.push((key.as_str(), value.clone()));
    }

    let query = if pairs.is_empty() {
        String::new()
    } else {
        format!("?{}", build_query(&pairs))
    };

    format!(
        "ss://{}@{}:{}{}#{}",
        userinfo,
        format_host(&server.address),
        server.port,
        query,
        urlencoding::encode(&server.name)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sip002_base64_userinfo() {
        let codec = ShadowsocksCodec;
        let uri = "ss://YWVzLTEyOC1nY206cGFzc3dvcmQ@server.example.com:8388#My%20Server";
        let server = codec.parse(uri).unwrap();

        assert_eq!(server.address, "server.example.com");
        assert_eq!(server.port, 8388);
        assert_eq!(server.name, "My Server");

        if let ProtocolConfig::Shadowsocks {
            method, password, ..
        } = &server.config
        {
            assert_eq!(method, "aes-128-gcm");
            assert_eq!(password, "password");
        } else {
            panic!("Expected Shadowsocks config");
        }
    }

    #[test]
    fn test_sip002_plain_userinfo() {
        let codec = ShadowsocksCodec;
        let server = codec
            .parse("ss://chacha20-ietf-poly1305:secret@host.com:443#Plain")
            .unwrap();

        if let ProtocolConfig::Shadowsocks {
            method, password, ..
        } = &server.config
        {
            assert_eq!(method, "chacha20-ietf-poly1305");
            assert_eq!(password, "secret");
        } else {
            panic!("Expected Shadowsocks config");
        }
    }

    #[test]
    fn test_legacy_format() {
        // Base64 of "aes-128-gcm:password@server.example.com:8388"
        let codec = ShadowsocksCodec;
        let uri = "ss://YWVzLTEyOC1nY206cGFzc3dvcmRAc2VydmVyLmV4YW1wbGUuY29tOjgzODg#Test";
        let server = codec.parse(uri).unwrap();

        assert_eq!(server.address, "server.example.com");
        assert_eq!(server.port, 8388);

        if let ProtocolConfig::Shadowsocks {
            method, password, ..
        } = &server.config
        {
            assert_eq!(method, "aes-128-gcm");
            assert_eq!(password, "password");
        } else {
            panic!("Expected Shadowsocks config");
        }
    }

    #[test]
    fn test_without_tag_derives_name() {
        let codec = ShadowsocksCodec;
        let server = codec
            .parse("ss://YWVzLTEyOC1nY206cGFzc3dvcmQ@example.com:443")
            .unwrap();
        assert_eq!(server.name, "example.com:443");
    }

    #[test]
    fn test_plugin_and_extra_params() {
        let codec = ShadowsocksCodec;
        let uri = "ss://YWVzLTEyOC1nY206cGFzc3dvcmQ@h.com:443?plugin=v2ray-plugin%3Btls&future=1#P";
        let server = codec.parse(uri).unwrap();

        if let ProtocolConfig::Shadowsocks { plugin, extra, .. } = &server.config {
            assert_eq!(plugin.as_deref(), Some("v2ray-plugin;tls"));
            assert_eq!(extra.get("future").map(String::as_str), Some("1"));
        } else {
            panic!("Expected Shadowsocks config");
        }
    }

    #[test]
    fn test_ipv6_host() {
        let codec = ShadowsocksCodec;
        let server = codec
            .parse("ss://YWVzLTEyOC1nY206cGFzc3dvcmQ@[::1]:8388#v6")
            .unwrap();
        assert_eq!(server.address, "[::1]");
        assert_eq!(server.port, 8388);
    }

    #[test]
    fn test_invalid_port() {
        let codec = ShadowsocksCodec;
        assert!(matches!(
            codec.parse("ss://YWVzLTEyOC1nY206cGFzc3dvcmQ@host.com:notaport"),
            Err(ParseError::InvalidPort)
        ));
        assert!(matches!(
            codec.parse("ss://YWVzLTEyOC1nY206cGFzc3dvcmQ@host.com:0"),
            Err(ParseError::InvalidPort)
        ));
    }

    #[test]
    fn test_malformed_userinfo() {
        let codec = ShadowsocksCodec;
        assert!(matches!(
            codec.parse("ss://no-colon-here@host.com:443"),
            Err(ParseError::MalformedCredential(_))
        ));
    }

    #[test]
    fn test_roundtrip() {
        let codec = ShadowsocksCodec;
        let uri = "ss://YWVzLTEyOC1nY206cGFzc3dvcmQ@server.com:8388?plugin=obfs-local&k=v#Node";
        let first = codec.parse(uri).unwrap();
        let second = codec.parse(&super::serialize(&first)).unwrap();
        assert!(first.semantic_eq(&second));
    }

    #[test]
    fn test_legacy_roundtrip_is_sip002() {
        let codec = ShadowsocksCodec;
        let uri = "ss://YWVzLTEyOC1nY206cGFzc3dvcmRAc2VydmVyLmV4YW1wbGUuY29tOjgzODg#Legacy";
        let first = codec.parse(uri).unwrap();
        let serialized = super::serialize(&first);
        assert!(serialized.contains('@'));
        let second = codec.parse(&serialized).unwrap();
        assert!(first.semantic_eq(&second));
    }
}
