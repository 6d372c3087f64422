//! Canonical data model
//!
//! This module defines the protocol-agnostic server description produced by
//! the URI codecs, the subscription metadata attached to remote profiles,
//! and the persisted profile/server records owned by the store.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Protocol Configuration
// ============================================================================

/// Protocol-specific configuration, tagged by protocol.
///
/// Known fields are typed per protocol; every structured variant carries an
/// `extra` map holding query parameters the codec did not recognize, so data
/// from newer subscription sources is never dropped on re-sync. The map is
/// ordered to keep persisted JSON and generated configs deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum ProtocolConfig {
    Vless {
        uuid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        flow: Option<String>,
        /// `none`, `tls` or another security mode from the source URI
        security: String,
        /// Transport network: `tcp`, `ws`, `grpc`, `http`
        network: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sni: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alpn: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fingerprint: Option<String>,
        /// VLESS wire encryption, effectively always `none`
        encryption: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        extra: BTreeMap<String, String>,
    },
    Vmess {
        uuid: String,
        alter_id: u32,
        /// VMess cipher selection, defaults to `auto`
        security: String,
        network: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host: Option<String>,
        tls: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sni: Option<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        extra: BTreeMap<String, String>,
    },
    Trojan {
        password: String,
        security: String,
        network: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sni: Option<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        extra: BTreeMap<String, String>,
    },
    Shadowsocks {
        method: String,
        password: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        plugin: Option<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        extra: BTreeMap<String, String>,
    },
    /// A proxy URI whose scheme is recognized but has no structured codec
    /// yet (hysteria2, tuic, ...). Kept opaque so it survives re-sync; the
    /// original URI lives in [`ParsedServer::raw_uri`].
    Opaque { scheme: String },
}

impl ProtocolConfig {
    /// The URI scheme / engine protocol discriminant
    pub fn scheme(&self) -> &str {
        match self {
            ProtocolConfig::Vless { .. } => "vless",
            ProtocolConfig::Vmess { .. } => "vmess",
            ProtocolConfig::Trojan { .. } => "trojan",
            ProtocolConfig::Shadowsocks { .. } => "ss",
            ProtocolConfig::Opaque { scheme } => scheme,
        }
    }
}

// ============================================================================
// Parsed Server
// ============================================================================

/// Canonical, protocol-agnostic description of a single proxy server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedServer {
    /// Display label; derived as `host:port` when the source URI has none
    pub name: String,
    /// Exact input string, retained for lossless round-trip and debugging
    pub raw_uri: String,
    pub address: String,
    pub port: u16,
    pub config: ProtocolConfig,
}

impl ParsedServer {
    /// Semantic equality: everything except the raw source string.
    ///
    /// `serialize` does not reproduce the input byte-for-byte, so a
    /// round-tripped server differs in `raw_uri` but nothing else.
    pub fn semantic_eq(&self, other: &ParsedServer) -> bool {
        self.name == other.name
            && self.address == other.address
            && self.port == other.port
            && self.config == other.config
    }
}

// ============================================================================
// Subscription Metadata
// ============================================================================

/// Default refresh interval when the subscription source does not supply one
pub const DEFAULT_UPDATE_INTERVAL_MINUTES: u32 = 60;

/// Metadata attached to a remote subscription, sourced from the
/// `subscription-userinfo` style response header side channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub title: Option<String>,
    pub upload_bytes: u64,
    pub download_bytes: u64,
    pub total_bytes: u64,
    pub expires_at: Option<DateTime<Utc>>,
    pub update_interval_minutes: u32,
    pub support_url: Option<String>,
}

impl Default for SubscriptionInfo {
    fn default() -> Self {
        Self {
            title: None,
            upload_bytes: 0,
            download_bytes: 0,
            total_bytes: 0,
            expires_at: None,
            update_interval_minutes: DEFAULT_UPDATE_INTERVAL_MINUTES,
            support_url: None,
        }
    }
}

impl SubscriptionInfo {
    pub fn consumed_bytes(&self) -> u64 {
        self.upload_bytes.saturating_add(self.download_bytes)
    }

    /// Fraction of the traffic allowance consumed, clamped to `0.0..=1.0`.
    /// A zero allowance reads as zero usage rather than a division error.
    pub fn usage_ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.consumed_bytes() as f64 / self.total_bytes as f64).clamp(0.0, 1.0)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if now > at)
    }

    /// Time left until expiry; zero when expired or when no expiry is set
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        match self.expires_at {
            Some(at) if now <= at => at - now,
            _ => Duration::zero(),
        }
    }
}

// ============================================================================
// Profiles and Servers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileKind {
    /// Servers added and edited directly by the user; never touched by sync
    Local,
    /// Servers owned by a subscription; replaced wholesale on each sync
    Remote,
}

impl ProfileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileKind::Local => "local",
            ProfileKind::Remote => "remote",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "local" => Some(ProfileKind::Local),
            "remote" => Some(ProfileKind::Remote),
            _ => None,
        }
    }
}

/// A profile owning zero-or-more servers.
///
/// At most one profile is active system-wide; the store enforces this inside
/// `set_active`, not the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub name: String,
    pub kind: ProfileKind,
    /// Ciphertext of the subscription URL; `None` for local profiles
    pub subscription_url: Option<String>,
    pub is_active: bool,
    pub sort_order: i64,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: Option<DateTime<Utc>>,
    pub info: SubscriptionInfo,
}

impl Profile {
    /// Whether this remote profile is due for a scheduled refresh.
    ///
    /// A never-synced remote profile is always due; local profiles never are.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if self.kind != ProfileKind::Remote {
            return false;
        }
        match self.last_updated_at {
            None => true,
            Some(last) => {
                now - last >= Duration::minutes(i64::from(self.info.update_interval_minutes))
            }
        }
    }
}

/// Persisted form of [`ParsedServer`], owned exclusively by one profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: Uuid,
    pub profile_id: Uuid,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub raw_uri: String,
    pub config: ProtocolConfig,
    pub remark: Option<String>,
    pub is_favorite: bool,
    /// Dense and zero-based within a profile after any reorder or replace
    pub sort_order: i64,
    pub latency_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Server {
    pub fn from_parsed(profile_id: Uuid, parsed: ParsedServer, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            profile_id,
            name: parsed.name,
            address: parsed.address,
            port: parsed.port,
            raw_uri: parsed.raw_uri,
            config: parsed.config,
            remark: None,
            is_favorite: false,
            sort_order: 0,
            latency_ms: None,
            created_at: now,
        }
    }

    pub fn to_parsed(&self) -> ParsedServer {
        ParsedServer {
            name: self.name.clone(),
            raw_uri: self.raw_uri.clone(),
            address: self.address.clone(),
            port: self.port,
            config: self.config.clone(),
        }
    }
}
