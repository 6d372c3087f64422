//! VLESS protocol codec
//!
//! Format: vless://uuid@host:port?params#name

use tracing::trace;
use url::Url;

use crate::error::ParseError;
use crate::model::{ParsedServer, ProtocolConfig};

use super::{ProtocolCodec, build_query, display_name, format_host, require_port, split_query};

const CANONICAL_KEYS: &[&str] = &[
    "security",
    "sni",
    "type",
    "path",
    "host",
    "alpn",
    "fp",
    "flow",
    "encryption",
];

pub struct VlessCodec;

impl ProtocolCodec for VlessCodec {
    fn scheme(&self) -> &str {
        "vless"
    }

    fn parse(&self, uri: &str) -> Result<ParsedServer, ParseError> {
        trace!("Parsing VLESS URI");
        let url = Url::parse(uri).map_err(|e| ParseError::MalformedUri(e.to_string()))?;

        let uuid = url.username().to_string();
        if uuid.is_empty() {
            return Err(ParseError::MalformedCredential(
                "VLESS URI missing UUID".to_string(),
            ));
        }

        let address = url
            .host_str()
            .ok_or_else(|| ParseError::MalformedUri("VLESS URI missing host".to_string()))?
            .to_string();
        let port = require_port(url.port())?;

        let (known, extra) = split_query(&url, CANONICAL_KEYS);
        let name = display_name(url.fragment(), &address, port);

        Ok(ParsedServer {
            name,
            raw_uri: uri.to_string(),
            address,
            port,
            config: ProtocolConfig::Vless {
                uuid,
                flow: known.get("flow").cloned(),
                security: known
                    .get("security")
                    .cloned()
                    .unwrap_or_else(|| "none".to_string()),
                network: known
                    .get("type")
                    .cloned()
                    .unwrap_or_else(|| "tcp".to_string()),
                path: known.get("path").cloned(),
                host: known.get("host").cloned(),
                sni: known.get("sni").cloned(),
                alpn: known.get("alpn").cloned(),
                fingerprint: known.get("fp").cloned(),
                encryption: known
                    .get("encryption")
                    .cloned()
                    .unwrap_or_else(|| "none".to_string()),
                extra,
            },
        })
    }
}

/// Serializes a VLESS server back to URI form
pub(super) fn serialize(server: &ParsedServer) -> String {
    let ProtocolConfig::Vless {
        uuid,
        flow,
        security,
        network,
        path,
        host,
        sni,
        alpn,
        fingerprint,
        encryption,
        extra,
    } = &server.config
    else {
        unreachable!("serialize dispatched on variant");
    };

    let mut pairs: Vec<(&str, String)> = vec![
        ("encryption", encryption.clone()),
        ("security", security.clone()),
        ("type", network.clone()),
    ];
    if let Some(flow) = flow {
        pairs.push(("flow", flow.clone()));
    }
    if let Some(sni) = sni {
        pairs.push(("sni", sni.clone()));
    }
    if let Some(path) = path {
        pairs.push(("path", path.clone()));
    }
    if let Some(host) = host {
        pairs.push(("host", host.clone()));
    }
    if let Some(alpn) = alpn {
        pairs.push(("alpn", alpn.clone()));
    }
    if let Some(fp) = fingerprint {
        pairs.push(("fp", fp.clone()));
    }
    for (key, value) in extra {
        pairs.push((key.as_str(), value.clone()));
    }

    format!(
        "vless://{}@{}:{}?{}#{}",
        uuid,
        format_host(&server.address),
        server.port,
        build_query(&pairs),
        urlencoding::encode(&server.name)
    )
}
