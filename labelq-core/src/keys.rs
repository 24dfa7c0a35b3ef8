//! Key namespaces used in the lease store.
//!
//! These are part of the persisted layout and are shared by every process
//! that talks to the same lease store. Do not change them without migrating.

use crate::item::{CallerId, ItemId};

/// Per-item lease. Value is the owning caller id.
pub const ITEM_LEASE_PREFIX: &str = "lock:item:";

/// Per-caller pointer to the item currently assigned to them.
pub const CURRENT_ITEM_PREFIX: &str = "user:current_item:";

/// Per-caller pointer to the prompt handle for the current item.
pub const CURRENT_PROMPT_PREFIX: &str = "user:current_msg:";

/// Short-lived per-caller guard held while a task request resolves, so
/// overlapping requests from one caller cannot claim two items.
pub const REQUEST_GUARD_PREFIX: &str = "user:claiming:";

/// Single lease serializing reconciliation sweeps across instances.
pub const SWEEPER_LEASE_KEY: &str = "lock:sweeper";

pub fn item_lease(item_id: ItemId) -> String {
    format!("{}{}", ITEM_LEASE_PREFIX, item_id)
}

pub fn current_item(caller: CallerId) -> String {
    format!("{}{}", CURRENT_ITEM_PREFIX, caller)
}

pub fn current_prompt(caller: CallerId) -> String {
    format!("{}{}", CURRENT_PROMPT_PREFIX, caller)
}

pub fn request_guard(caller: CallerId) -> String {
    format!("{}{}", REQUEST_GUARD_PREFIX, caller)
}
