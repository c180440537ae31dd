#[cfg(feature = "browser")]
pub mod browser;
pub mod http;

#[cfg(feature = "browser")]
pub use browser::{BrowserSession, BrowserSessionProvider};
pub use http::{HttpSession, HttpSessionProvider};
