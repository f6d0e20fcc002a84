pub mod bots;
pub mod users;
