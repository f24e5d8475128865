// Application layer - session state and orchestration.
// The store owns client-side ledger state, the service is the only caller of the
// remote ledger, and sync/sweeper keep the store current in the background.

pub mod error;
pub mod service;
pub mod store;
pub mod sweeper;
pub mod sync;

pub use error::*;
pub use service::{DeductionRequest, LedgerService, PurchaseReceipt, SpendReceipt};
pub use store::{Adjustment, LedgerSnapshot, LedgerStore, SweepOutcome};
pub use sweeper::{Sweeper, SweeperHandle};
pub use sync::{BalanceUpdate, PushEvent, SyncChannel, SyncStats, SyncSubscription, parse_push_message};
