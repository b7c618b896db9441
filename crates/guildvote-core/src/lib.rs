pub mod ballot;
pub mod cache;
pub mod clock;
pub mod error;
pub mod gateway;
pub mod observability;
pub mod reconcile;
pub mod render;
pub mod scope_lock;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::StoreError;
pub use gateway::{Gateway, GatewayError, LogGateway};
pub use reconcile::{ReconcileConfig, ReconcileError, ReconciliationScheduler, TickOutcome};
pub use render::{Renderer, TextRenderer};
pub use scope_lock::ScopeHandle;
pub use store::{PollEdit, PollKey, StoreConfig, VoteStore};
