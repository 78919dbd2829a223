//! Hot-read caches feeding both broadcast and REST responses.

pub mod ltp;

pub use ltp::LtpCache;
