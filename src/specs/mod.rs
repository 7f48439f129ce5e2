pub mod arena;
pub mod openai;
