pub mod events;
pub mod health;
pub mod sessions;
pub mod submit;
pub mod ws;
