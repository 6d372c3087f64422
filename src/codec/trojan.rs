//! Trojan protocol codec
//!
//! Format: trojan://password@host:port?params#name

use tracing::trace;
use url::Url;

use crate::error::ParseError;
use crate::model::{ParsedServer, ProtocolConfig};

use super::{ProtocolCodec, build_query, display_name, format_host, require_port, split_query};

const CANONICAL_KEYS: &[&str] = &["security", "sni", "type", "path", "host"];

pub struct TrojanCodec;

impl ProtocolCodec for TrojanCodec {
    fn scheme(&self) -> &str {
        "trojan"
    }

    fn parse(&self, uri: &str) -> Result<ParsedServer, ParseError> {
        trace!("Parsing Trojan URI");
        let url = Url::parse(uri).map_err(|e| ParseError::MalformedUri(e.to_string()))?;

        let password = urlencoding::decode(url.username())
            .unwrap_or_else(|_| url.username().into())
            .into_owned();
        if password.is_empty() {
            return Err(ParseError::MalformedCredential(
                "Trojan URI missing password".to_string(),
            ));
        }

        let address = url
            .host_str()
            .ok_or_else(|| ParseError::MalformedUri("Trojan URI missing host".to_string()))?
            .to_string();
        let port = require_port(url.port())?;

        let (known, extra) = split_query(&url, CANONICAL_KEYS);
        let name = display_name(url.fragment(), &address, port);

        Ok(ParsedServer {
            name,
            raw_uri: uri.to_string(),
            address,
            port,
            config: ProtocolConfig::Trojan {
                password,
                // Trojan runs over TLS unless the link opts out explicitly
                security: known
                    .get("security")
                    .cloned()
                    .unwrap_or_else(|| "tls".to_string()),
                network: known
                    .get("type")
                    .cloned()
                    .unwrap_or_else(|| "tcp".to_string()),
                path: known.get("path").cloned(),
                host: known.get("host").cloned(),
                sni: known.get("sni").cloned(),
                extra,
            },
        })
    }
}

/// Serializes a Trojan server back to URI form
pub(super) fn serialize(server: &ParsedServer) -> String {
    let ProtocolConfig::Trojan {
        password,
        security,
        network,
        path,
        host,
        sni,
        extra,
    } = &server.config
    else {
        unreachable!("serialize dispatched on variant");
    };

    let mut pairs: Vec<(&str, String)> = vec![
        ("security", security.clone()),
        ("type", network.clone()),
    ];
    if let Some(sni) = sni {
        pairs.push(("sni", sni.clone()));
    }
    if let Some(path) = path {
        pairs.push(("path", path.clone()));
    }
    if let Some(host) = host {
        pairs.push(("host", host.clone()));
    }
    for (key, value) in extra {
        pairs.push((key.as_str(), value.clone()));
    }

    format!(
        "trojan://{}@{}:{}?{}#{}",
        urlencoding::encode(password),
        format_host(&server.address),
        server.port,
        build_query(&pairs),
        urlencoding::encode(&server.name)
    )
}
