pub mod html;
pub mod network;
