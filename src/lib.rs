pub mod codec;
pub mod error;
pub mod genconfig;
pub mod model;
pub mod secret;
pub mod store;
pub mod subscription;
pub mod sync;

pub use codec::{ParseReport, ProtocolCodec, UriCodec};
pub use error::{
    ConfigError, DecodeError, FetchError, ParseError, SecretError, StoreError, SyncError,
};
pub use genconfig::{EngineConfig, GenerateOptions};
pub use model::{
    ParsedServer, Profile, ProfileKind, ProtocolConfig, Server, SubscriptionInfo,
};
pub use secret::{AeadSecretStore, EncryptedFieldService, SecretStore};
pub use store::ProfileStore;
pub use sync::{HttpFetcher, ProfileSyncEngine, SubscriptionFetcher, SweepReport};

pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
