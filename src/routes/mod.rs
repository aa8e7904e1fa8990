pub mod gateway;

pub use gateway::{chat_completions, AppState};
