//! Production implementations of the trait seams

mod sender;

pub use sender::HttpSender;
