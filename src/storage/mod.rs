pub mod folder;
pub mod hasher;
pub mod mirror;
pub mod pipeline;
