pub mod gmail;
pub mod message;
pub mod provider;
pub mod threading;
