pub mod callbacks;
pub mod channel;
pub mod health;
pub mod manager;

pub use callbacks::CallbackId;
pub use channel::{LocalPushChannel, PgPushChannel, PushChannel};
pub use manager::RealtimeManager;
