pub mod models;
pub mod pii;

pub use models::events::{CapacitySyncMessage, OrderPaidMessage};
pub use models::hold::{HoldEntry, HoldMetadata, HoldRecord, HoldStatus};
pub use models::inventory::{InventoryCounter, Selection};
pub use models::queue::{QueueEntry, QueueEntryStatus};
pub use pii::Redacted;
