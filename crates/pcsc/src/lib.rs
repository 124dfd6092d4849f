//! PC/SC transport implementation for pivkit
//!
//! This crate realizes the [`pivkit_apdu_core::CardTransport`] interface on
//! top of the system PC/SC service:
//!
//! - [`PcscDeviceManager`] establishes a context and lists readers
//! - [`PcscTransport`] owns one card connection (T=0 or T=1) and drives raw
//!   transmission plus exclusive transactions, including the
//!   reconnect-on-reset retry and the reset-on-release policy
//!
//! ```no_run
//! use pivkit_apdu_pcsc::PcscDeviceManager;
//!
//! let manager = PcscDeviceManager::new()?;
//! for reader in manager.list_readers()? {
//!     println!("{} (card present: {})", reader.name(), reader.has_card());
//! }
//! # Ok::<(), pivkit_apdu_pcsc::PcscError>(())
//! ```

pub mod config;
mod error;
mod manager;
mod reader;
mod transport;

pub use config::PcscConfig;
pub use error::PcscError;
pub use manager::PcscDeviceManager;
pub use reader::PcscReader;
pub use transport::PcscTransport;
