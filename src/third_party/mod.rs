pub mod media_fetch;
pub mod translate;
