pub mod artifacts;
pub mod browser;
pub mod capture;
pub mod config;
pub mod error;
pub mod matcher;
pub mod navigator;
pub mod recorder;

//  Re-export commonly used items
pub use artifacts::{ArtifactPaths, ArtifactWriter};
pub use browser::chrome::{ChromeSession, ConnectionMode};
pub use capture::{capture_in_session, capture_page, CaptureResult};
pub use config::{CaptureConfig, CaptureOptions, DEFAULT_OUTPUT_DIR, USAGE};
pub use error::CaptureError;
pub use navigator::LoadedPage;
pub use recorder::{ResponseEvent, ResponseRecord, ResponseRecorder, ResponseTable};
