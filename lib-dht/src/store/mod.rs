//! Local record stores: best-effort values, provider announcements, and
//! validated signed peer records, each with per-entry expiry and a cleanup
//! scan driven by the background loops. Stores optionally write through to
//! an external key/value engine (see [`persistent`]).

pub mod peer_record;
pub mod persistent;
pub mod provider;
pub mod provider_cache;
pub mod value;

pub use peer_record::PeerRecordStore;
pub use provider::{ProviderRecord, ProviderStore};
pub use provider_cache::{ProviderCache, ProviderCacheStats};
pub use value::{ValueRecord, ValueStore};
