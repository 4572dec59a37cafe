pub mod call;
pub mod user;

pub use call::{CallIntent, CallMode, CallRole, ChannelKey};
pub use user::UserId;
