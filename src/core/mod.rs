//! Domain atoms shared by every layer: identities, versioned records, and
//! the deterministic merge.

mod error;
mod ids;
mod value;

pub use error::{CoreError, InvalidId, Transience};
pub use ids::{AreaId, NodeId};
pub use value::{
    identity_ordering, merge, merge_winner, sync_ordering, MergeOutcome, Ttl, ValueHash,
    VersionedValue,
};
