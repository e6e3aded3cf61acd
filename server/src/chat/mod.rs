pub mod cache;
pub mod conversation;
pub mod dispatch;
pub mod history;
pub mod messages;
pub mod models;
pub mod presence;
