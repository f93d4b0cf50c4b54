pub mod chrome;

pub use chrome::{ChromeSession, ConnectionMode};
