//! Engine configuration generation
//!
//! Maps a canonical [`ParsedServer`] plus global options into the outbound
//! JSON structure the downstream proxy engine consumes. Generation is pure:
//! no I/O, and identical inputs always yield byte-identical JSON, which is
//! what makes config diffing and testing possible.
//!
//! The engine treats key presence as a feature toggle, so `tlsSettings` and
//! `wsSettings` are omitted entirely rather than set to null when unused.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;
use crate::model::{ParsedServer, ProtocolConfig};

// ============================================================================
// Engine Config Shape
// ============================================================================

/// Global settings applied to every generated config
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateOptions {
    /// Fixed ordered DNS server list, identical across all generated configs
    pub dns_servers: Vec<String>,
}

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub outbounds: Vec<OutboundConfig>,
    pub dns: DnsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundConfig {
    pub protocol: String,
    pub settings: OutboundSettings,
    #[serde(rename = "streamSettings")]
    pub stream_settings: StreamSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundSettings {
    pub vnext: Vec<VnextServer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VnextServer {
    pub address: String,
    pub port: u16,
    pub users: Vec<OutboundUser>,
}

/// Per-protocol user credential entry. Unused fields are omitted from the
/// serialized form rather than emitted as nulls.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OutboundUser {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<String>,
    #[serde(rename = "alterId", skip_serializing_if = "Option::is_none")]
    pub alter_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSettings {
    pub network: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,
    #[serde(rename = "tlsSettings", skip_serializing_if = "Option::is_none")]
    pub tls_settings: Option<TlsSettings>,
    #[serde(rename = "wsSettings", skip_serializing_if = "Option::is_none")]
    pub ws_settings: Option<WsSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsSettings {
    #[serde(rename = "serverName")]
    pub server_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsSettings {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsConfig {
    pub servers: Vec<String>,
}

// ============================================================================
// Generation
// ============================================================================

/// Builds the engine configuration for a single server.
///
/// Servers with an opaque protocol are stored and synced like any other,
/// but requesting a config for them is an explicit error rather than a
/// best-effort partial config.
pub fn generate(
    server: &ParsedServer,
    options: &GenerateOptions,
) -> Result<EngineConfig, ConfigError> {
    debug!(
        "Generating engine config for '{}' ({})",
        server.name,
        server.config.scheme()
    );

    let outbound = match &server.config {
        ProtocolConfig::Vless {
            uuid,
            security,
            network,
            path,
            sni,
            ..
        } => OutboundConfig {
            protocol: "vless".to_string(),
            settings: vnext_settings(
                server,
                OutboundUser {
                    id: Some(uuid.clone()),
                    encryption: Some("none".to_string()),
                    ..Default::default()
                },
            ),
            stream_settings: stream_settings(server, network, security == "tls", sni, path),
        },
        ProtocolConfig::Vmess {
            uuid,
            alter_id,
            security,
            network,
            path,
            tls,
            sni,
            ..
        } => OutboundConfig {
            protocol: "vmess".to_string(),
            settings: vnext_settings(
                server,
                OutboundUser {
                    id: Some(uuid.clone()),
                    alter_id: Some(*alter_id),
                    security: Some(security.clone()),
                    ..Default::default()
                },
            ),
            stream_settings: stream_settings(server, network, *tls, sni, path),
        },
        ProtocolConfig::Trojan {
            password,
            security,
            network,
            path,
            sni,
            ..
        } => OutboundConfig {
            protocol: "trojan".to_string(),
            settings: vnext_settings(
                server,
                OutboundUser {
                    password: Some(password.clone()),
                    ..Default::default()
                },
            ),
            stream_settings: stream_settings(server, network, security == "tls", sni, path),
        },
        ProtocolConfig::Shadowsocks {
            method, password, ..
        } => OutboundConfig {
            protocol: "shadowsocks".to_string(),
            settings: vnext_settings(
                server,
                OutboundUser {
                    method: Some(method.clone()),
                    password: Some(password.clone()),
                    ..Default::default()
                },
            ),
            stream_settings: stream_settings(server, "tcp", false, &None, &None),
        },
        ProtocolConfig::Opaque { scheme } => {
            return Err(ConfigError::UnsupportedProtocol(scheme.clone()));
        }
    };

    Ok(EngineConfig {
        outbounds: vec![outbound],
        dns: DnsConfig {
            servers: options.dns_servers.clone(),
        },
    })
}

/// Serializes the generated config to JSON. Byte-for-byte identical output
/// for identical `(server, options)` inputs.
pub fn generate_json(
    server: &ParsedServer,
    options: &GenerateOptions,
) -> Result<String, ConfigError> {
    let config = generate(server, options)?;
    // Struct serialization has a fixed field order and cannot fail
    Ok(serde_json::to_string(&config).expect("engine config serializes"))
}

fn vnext_settings(server: &ParsedServer, user: OutboundUser) -> OutboundSettings {
    OutboundSettings {
        vnext: vec![VnextServer {
            address: server.address.clone(),
            port: server.port,
            users: vec![user],
        }],
    }
}

fn stream_settings(
    server: &ParsedServer,
    network: &str,
    tls: bool,
    sni: &Option<String>,
    path: &Option<String>,
) -> StreamSettings {
    let ws_settings = (network == "ws").then(|| WsSettings {
        // The engine requires the key when network is ws
        path: path.clone().unwrap_or_else(|| "/".to_string()),
    });

    // SNI must never be empty for TLS; fall back to the server address
    let tls_settings = tls.then(|| TlsSettings {
        server_name: sni
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| server.address.clone()),
    });

    StreamSettings {
        network: network.to_string(),
        security: tls.then(|| "tls".to_string()),
        tls_settings,
        ws_settings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::UriCodec;

    fn options() -> GenerateOptions {
        GenerateOptions {
            dns_servers: vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()],
        }
    }

    fn parse(uri: &str) -> ParsedServer {
        UriCodec::with_builtin_codecs().parse(uri).unwrap()
    }

    #[test]
    fn test_vless_ws_tls_config() {
        let server = parse("vless://uuid@1.2.3.4:443?security=tls&type=ws&path=/ws#MyServer");
        let config = generate(&server, &options()).unwrap();

        let outbound = &config.outbounds[0];
        assert_eq!(outbound.protocol, "vless");

        let vnext = &outbound.settings.vnext[0];
        assert_eq!(vnext.address, "1.2.3.4");
        assert_eq!(vnext.port, 443);
        assert_eq!(vnext.users[0].id.as_deref(), Some("uuid"));
        assert_eq!(vnext.users[0].encryption.as_deref(), Some("none"));

        let stream = &outbound.stream_settings;
        assert_eq!(stream.network, "ws");
        assert_eq!(stream.ws_settings.as_ref().unwrap().path, "/ws");
        // No SNI in the URI: serverName falls back to the address
        assert_eq!(
            stream.tls_settings.as_ref().unwrap().server_name,
            "1.2.3.4"
        );
        assert_eq!(config.dns.servers, vec!["1.1.1.1", "8.8.8.8"]);
    }

    #[test]
    fn test_tls_sni_fallback_to_address() {
        let server = parse("vless://uuid@example.com:443?security=tls#x");
        let config = generate(&server, &options()).unwrap();
        assert_eq!(
            config.outbounds[0]
                .stream_settings
                .tls_settings
                .as_ref()
                .unwrap()
                .server_name,
            "example.com"
        );
    }

    #[test]
    fn test_tls_sni_explicit() {
        let server = parse("vless://uuid@example.com:443?security=tls&sni=cdn.example.net#x");
        let config = generate(&server, &options()).unwrap();
        assert_eq!(
            config.outbounds[0]
                .stream_settings
                .tls_settings
                .as_ref()
                .unwrap()
                .server_name,
            "cdn.example.net"
        );
    }

    #[test]
    fn test_no_tls_omits_tls_settings_key() {
        let server = parse("vless://uuid@example.com:8080#x");
        let json = generate_json(&server, &options()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        let stream = &value["outbounds"][0]["streamSettings"];
        assert!(stream.get("tlsSettings").is_none());
        assert!(stream.get("security").is_none());
        assert_eq!(stream["network"], "tcp");
    }

    #[test]
    fn test_ws_path_defaults_to_slash() {
        let server = parse("vless://uuid@example.com:443?type=ws#x");
        let config = generate(&server, &options()).unwrap();
        assert_eq!(
            config.outbounds[0]
                .stream_settings
                .ws_settings
                .as_ref()
                .unwrap()
                .path,
            "/"
        );
    }

    #[test]
    fn test_vmess_defaults() {
        let server = parse(&format!(
            "vmess://{}",
            crate::codec::base64::encode_base64(
                br#"{"ps":"V","add":"h.com","port":443,"id":"uuid"}"#
            )
        ));
        let config = generate(&server, &options()).unwrap();

        let user = &config.outbounds[0].settings.vnext[0].users[0];
        assert_eq!(user.alter_id, Some(0));
        assert_eq!(user.security.as_deref(), Some("auto"));
    }

    #[test]
    fn test_trojan_config() {
        let server = parse("trojan://pw@5.6.7.8:443#t");
        let config = generate(&server, &options()).unwrap();

        let outbound = &config.outbounds[0];
        assert_eq!(outbound.protocol, "trojan");
        assert_eq!(
            outbound.settings.vnext[0].users[0].password.as_deref(),
            Some("pw")
        );
        // Trojan defaults to TLS
        assert_eq!(
            outbound.stream_settings.tls_settings.as_ref().unwrap().server_name,
            "5.6.7.8"
        );
    }

    #[test]
    fn test_shadowsocks_config() {
        let server = parse("ss://YWVzLTEyOC1nY206cGFzc3dvcmQ@h.com:8388#s");
        let config = generate(&server, &options()).unwrap();

        let user = &config.outbounds[0].settings.vnext[0].users[0];
        assert_eq!(user.method.as_deref(), Some("aes-128-gcm"));
        assert_eq!(user.password.as_deref(), Some("password"));
        assert!(config.outbounds[0].stream_settings.tls_settings.is_none());
    }

    #[test]
    fn test_unsupported_protocol() {
        let server = parse("hysteria2://pw@h.com:443#h");
        assert!(matches!(
            generate(&server, &options()),
            Err(ConfigError::UnsupportedProtocol(scheme)) if scheme == "hysteria2"
        ));
    }

    #[test]
    fn test_generation_is_deterministic() {
        let server = parse("vless://uuid@1.2.3.4:443?security=tls&type=ws&path=/ws&b=2&a=1#d");
        let opts = options();
        let first = generate_json(&server, &opts).unwrap();
        let second = generate_json(&server, &opts).unwrap();
        assert_eq!(first, second);
    }
}
