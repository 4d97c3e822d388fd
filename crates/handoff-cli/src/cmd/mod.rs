pub mod cancel;
pub mod check;
pub mod config;
pub mod emit;
pub mod exec;
pub mod init;
pub mod serve;
pub mod session_id;
pub mod status;
pub mod submit;
