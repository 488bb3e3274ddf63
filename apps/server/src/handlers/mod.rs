pub mod appointments;
pub mod auth;
pub mod health;
pub mod master;
pub mod public;
pub mod reviews;
pub mod slots;
