pub mod events;
pub mod hold;
pub mod inventory;
pub mod queue;
