pub mod rest;
pub mod stream;

pub use rest::RestClient;
pub use stream::StreamClient;
