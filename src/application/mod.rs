pub mod conversation;
pub mod engine;
pub mod stream;
pub mod tooling;
