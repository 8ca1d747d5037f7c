pub mod extract;
pub mod infer;
pub mod placeholder;
