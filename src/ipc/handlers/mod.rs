pub mod admin;
pub mod assignments;
pub mod classes;
pub mod core;
pub mod files;
pub mod profiles;
pub mod reports;
pub mod submissions;
