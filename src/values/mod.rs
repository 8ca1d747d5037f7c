pub mod html;
pub mod normalize;
pub mod rich;
