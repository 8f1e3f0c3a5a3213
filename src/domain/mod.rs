//! 领域模型：用户、消息与线上帧 / Domain model: users, messages and wire frames

pub mod frame;
pub mod message;

pub use frame::{ClientFrame, ServerFrame};
pub use message::{Message, MessageKind, NewMessage, User, UserStatus, KIND_TEXT};
