pub mod embed;
pub mod engine;
pub mod fields;
pub mod ids;
pub mod repeat;
pub mod residual;
