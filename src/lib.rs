//! MMD Previewer - zipped model archives served from memory
//!
//! A model loader fetches textures by relative path, with no hook to feed it
//! in-memory data. An interception layer in front of the local origin answers
//! those fetches from the unpacked archive instead.

pub mod archive;
pub mod config;
pub mod fetch;
pub mod interceptor;
pub mod lifecycle;
pub mod paths;
pub mod protocol;
pub mod session;
pub mod storage;
