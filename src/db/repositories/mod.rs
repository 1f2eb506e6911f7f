pub mod kv;
pub mod sessions;
