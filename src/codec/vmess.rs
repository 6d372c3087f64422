//! VMess protocol codec
//!
//! VMess share links historically carry a Base64-encoded JSON payload in
//! lieu of standard URI structure:
//!
//!   vmess://BASE64({ "v": "2", "ps": "name", "add": "host", "port": 443, ... })
//!
//! A standard-URI form (vmess://uuid@host:port?params#name) also circulates.
//! The standard form is attempted first; when the body is not a valid URI
//! the codec falls back to Base64 JSON. Dispatch never leaves this codec.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;
use url::Url;

use crate::error::ParseError;
use crate::model::{ParsedServer, ProtocolConfig};

use super::base64::{decode_base64_str, encode_base64};
use super::{ProtocolCodec, display_name, require_port, split_query};

const CANONICAL_KEYS: &[&str] = &[
    "security",
    "sni",
    "type",
    "path",
    "host",
    "alterId",
    "encryption",
];

pub struct VmessCodec;

/// VMess share-link JSON payload. Ports and alter IDs appear both as
/// strings and as numbers in the wild; unknown keys are preserved.
#[derive(Serialize, Deserialize, Debug)]
struct VmessJson {
    /// Link format version, conventionally "2"
    #[serde(default = "default_version")]
    v: String,
    /// Remark / display name
    #[serde(default)]
    ps: String,
    add: String,
    #[serde(deserialize_with = "deserialize_port")]
    port: u16,
    id: String,
    #[serde(default, deserialize_with = "deserialize_option_u32")]
    aid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    net: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tls: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sni: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

fn default_version() -> String {
    "2".to_string()
}

impl ProtocolCodec for VmessCodec {
    fn scheme(&self) -> &str {
        "vmess"
    }

    fn parse(&self, uri: &str) -> Result<ParsedServer, ParseError> {
        trace!("Parsing VMess URI");

        // Standard-URI form first; only a body that is not a valid URI is
        // retried as Base64 JSON.
        if let Ok(url) = Url::parse(uri)
            && url.host_str().is_some()
            && !url.username().is_empty()
        {
            return self.parse_standard_uri(uri, &url);
        }

        self.parse_base64_json(uri)
    }
}

impl VmessCodec {
    fn parse_standard_uri(&self, uri: &str, url: &Url) -> Result<ParsedServer, ParseError> {
        let uuid = url.username().to_string();
        let address = url
            .host_str()
            .ok_or_else(|| ParseError::MalformedUri("VMess URI missing host".to_string()))?
            .to_string();
        let port = require_port(url.port())?;

        let (known, extra) = split_query(url, CANONICAL_KEYS);
        let name = display_name(url.fragment(), &address, port);

        Ok(ParsedServer {
            name,
            raw_uri: uri.to_string(),
            address,
            port,
            config: ProtocolConfig::Vmess {
                uuid,
                alter_id: known
                    .get("alterId")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
                security: known
                    .get("encryption")
                    .cloned()
                    .unwrap_or_else(|| "auto".to_string()),
                network: known
                    .get("type")
                    .cloned()
                    .unwrap_or_else(|| "tcp".to_string()),
                path: known.get("path").cloned(),
                host: known.get("host").cloned(),
                tls: known.get("security").map(String::as_str) == Some("tls"),
                sni: known.get("sni").cloned(),
                extra,
            },
        })
    }

    fn parse_base64_json(&self, uri: &str) -> Result<ParsedServer, ParseError> {
        let encoded = uri
            .strip_prefix("vmess://")
            .ok_or_else(|| ParseError::MalformedUri("missing vmess:// prefix".to_string()))?;

        let decoded = decode_base64_str(encoded).ok_or_else(|| {
            ParseError::MalformedCredential("VMess body is neither a URI nor Base64".to_string())
        })?;
        trace!("Decoded VMess JSON payload");

        let json: VmessJson = serde_json::from_str(&decoded)
            .map_err(|e| ParseError::MalformedCredential(format!("invalid VMess JSON: {}", e)))?;

        let port = require_port(Some(json.port))?;
        let name = if json.ps.is_empty() {
            format!("{}:{}", json.add, port)
        } else {
            json.ps.clone()
        };

        let extra = json
            .extra
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect();

        Ok(ParsedServer {
            name,
            raw_uri: uri.to_string(),
            address: json.add.clone(),
            port,
            config: ProtocolConfig::Vmess {
                uuid: json.id,
                alter_id: json.aid.unwrap_or(0),
                security: json.scy.unwrap_or_else(|| "auto".to_string()),
                network: json.net.unwrap_or_else(|| "tcp".to_string()),
                path: json.path,
                host: json.host,
                tls: json.tls.as_deref() == Some("tls"),
                sni: json.sni,
                extra,
            },
        })
    }
}

/// Serializes a VMess server to the conventional Base64-JSON share form
pub(super) fn serialize(server: &ParsedServer) -> String {
    let ProtocolConfig::Vmess {
        uuid,
        alter_id,
        security,
        network,
        path,
        host,
        tls,
        sni,
        extra,
    } = &server.config
    else {
        unreachable!("serialize dispatched on variant");
    };

    let json = VmessJson {
        v: default_version(),
        ps: server.name.clone(),
        add: server.address.clone(),
        port: server.port,
        id: uuid.clone(),
        aid: Some(*alter_id),
        scy: Some(security.clone()),
        net: Some(network.clone()),
        tls: tls.then(|| "tls".to_string()),
        sni: sni.clone(),
        host: host.clone(),
        path: path.clone(),
        extra: extra
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    };

    // Serialization of this struct cannot fail
    let payload = serde_json::to_string(&json).unwrap_or_default();
    format!("vmess://{}", encode_base64(payload.as_bytes()))
}

/// Port deserializer tolerating both string and number forms
fn deserialize_port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortValue {
        Number(u16),
        String(String),
    }

    match PortValue::deserialize(deserializer)? {
        PortValue::Number(n) => Ok(n),
        PortValue::String(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Optional u32 deserializer tolerating string, number and null forms
fn deserialize_option_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum U32Value {
        Number(u32),
        String(String),
        Null,
    }

    match Option::<U32Value>::deserialize(deserializer)? {
        Some(U32Value::Number(n)) => Ok(Some(n)),
        Some(U32Value::String(s)) if s.is_empty() => Ok(None),
        Some(U32Value::String(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
        Some(U32Value::Null) | None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_json(json: &str) -> String {
        format!("vmess://{}", encode_base64(json.as_bytes()))
    }

    #[test]
    fn test_vmess_base64_json_basic() {
        let uri = encode_json(
            r#"{"v":"2","ps":"Test Server","add":"server.com","port":443,"id":"uuid-here","aid":0,"scy":"auto","net":"tcp","tls":""}"#,
        );
        let server = VmessCodec.parse(&uri).unwrap();

        assert_eq!(server.name, "Test Server");
        assert_eq!(server.address, "server.com");
        assert_eq!(server.port, 443);

        if let ProtocolConfig::Vmess { uuid, tls, .. } = &server.config {
            assert_eq!(uuid, "uuid-here");
            assert!(!tls);
        } else {
            panic!("Expected Vmess config");
        }
    }

    #[test]
    fn test_vmess_string_port_and_aid() {
        let uri = encode_json(
            r#"{"ps":"S","add":"server.com","port":"8443","id":"uuid","aid":"2"}"#,
        );
        let server = VmessCodec.parse(&uri).unwrap();
        assert_eq!(server.port, 8443);

        if let ProtocolConfig::Vmess { alter_id, .. } = &server.config {
            assert_eq!(*alter_id, 2);
        } else {
            panic!("Expected Vmess config");
        }
    }

    #[test]
    fn test_vmess_with_websocket_tls() {
        let uri = encode_json(
            r#"{"ps":"WS","add":"server.com","port":443,"id":"uuid","net":"ws","tls":"tls","sni":"sni.com","path":"/ws","host":"host.com"}"#,
        );
        let server = VmessCodec.parse(&uri).unwrap();

        if let ProtocolConfig::Vmess {
            network,
            tls,
            sni,
            path,
            host,
            ..
        } = &server.config
        {
            assert_eq!(network, "ws");
            assert!(tls);
            assert_eq!(sni.as_deref(), Some("sni.com"));
            assert_eq!(path.as_deref(), Some("/ws"));
            assert_eq!(host.as_deref(), Some("host.com"));
        } else {
            panic!("Expected Vmess config");
        }
    }

    #[test]
    fn test_vmess_unknown_json_keys_preserved() {
        let uri = encode_json(
            r#"{"ps":"S","add":"a.com","port":443,"id":"uuid","alpn":"h2","fp":"chrome"}"#,
        );
        let server = VmessCodec.parse(&uri).unwrap();

        if let ProtocolConfig::Vmess { extra, .. } = &server.config {
            assert_eq!(extra.get("alpn").map(String::as_str), Some("h2"));
            assert_eq!(extra.get("fp").map(String::as_str), Some("chrome"));
        } else {
            panic!("Expected Vmess config");
        }
    }

    #[test]
    fn test_vmess_standard_uri_form() {
        let uri = "vmess://uuid@server.com:443?encryption=aes-128-gcm&security=tls&type=ws&path=/p#Std";
        let server = VmessCodec.parse(uri).unwrap();

        assert_eq!(server.name, "Std");
        if let ProtocolConfig::Vmess {
            uuid,
            security,
            tls,
            network,
            ..
        } = &server.config
        {
            assert_eq!(uuid, "uuid");
            assert_eq!(security, "aes-128-gcm");
            assert!(tls);
            assert_eq!(network, "ws");
        } else {
            panic!("Expected Vmess config");
        }
    }

    #[test]
    fn test_vmess_empty_name_derived() {
        let uri = encode_json(r#"{"add":"server.com","port":443,"id":"uuid"}"#);
        let server = VmessCodec.parse(&uri).unwrap();
        assert_eq!(server.name, "server.com:443");
    }

    #[test]
    fn test_vmess_garbage_body() {
        assert!(VmessCodec.parse("vmess://!!!not-base64!!!").is_err());
    }

    #[test]
    fn test_vmess_invalid_json() {
        let uri = format!("vmess://{}", encode_base64(b"not json"));
        assert!(matches!(
            VmessCodec.parse(&uri),
            Err(ParseError::MalformedCredential(_))
        ));
    }

    #[test]
    fn test_vmess_roundtrip() {
        let uri = encode_json(
            r#"{"v":"2","ps":"RT","add":"server.com","port":443,"id":"uuid","aid":0,"scy":"auto","net":"ws","tls":"tls","sni":"s.com","path":"/ws","host":"h.com","alpn":"h2"}"#,
        );
        let first = VmessCodec.parse(&uri).unwrap();
        let second = VmessCodec.parse(&serialize(&first)).unwrap();
        assert!(first.semantic_eq(&second));
    }
}
