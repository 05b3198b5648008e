//! Membership records - the lifecycle and storage core
//!
//! A record is created as an application, moved through the queue into the
//! member namespace (by an external process) and finally out into the
//! dequeue or archive namespaces. Each move is a single atomic batch.

mod codec;
mod error;
mod fields;
mod lifecycle;
mod models;
mod stage;
mod store;

pub use codec::ProjectedField;
pub use error::{MembershipError, MembershipResult};
pub use fields::FieldUpdate;
pub use lifecycle::{LifecycleManager, Transition, TransitionReceipt};
pub use models::{MemberData, MemberProfile, MembershipMetadata, RecordEntry, RecordKey};
pub use stage::Stage;
pub use store::StageStore;
