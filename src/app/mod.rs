pub mod logging;
pub mod login;
