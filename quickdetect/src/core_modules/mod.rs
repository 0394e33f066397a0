pub mod decoder;
pub mod fetcher;
pub mod media;
pub mod model;
pub mod preset;
pub mod result;
pub mod run;
pub mod stream_buffer;
pub mod task;
