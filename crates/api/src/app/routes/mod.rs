pub mod admin;
pub mod system;
pub mod uploads;
pub mod users;
