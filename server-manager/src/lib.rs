pub mod backup;
pub mod config;
pub mod console;
pub mod downloader;
pub mod error;
pub mod fleet;
pub mod monitor;
pub mod plugins;
pub mod portal;
pub mod process;
pub mod proxy;
pub mod settings;
pub mod store;
pub mod supervisor;
pub mod types;
pub mod world;

pub use downloader::{BinaryProvider, JarDownloader, ProgressFn};
pub use error::{ManagerError, Result};
pub use portal::{NewPortal, PortalUpdate};
pub use settings::Settings;
pub use supervisor::{NewServer, Supervisor};
pub use types::*;
