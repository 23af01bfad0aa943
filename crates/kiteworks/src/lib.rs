//! kiteworks REST resources on top of [`kitebroker_api`].
//!
//! [`Kiteworks`] wraps a [`Session`](kitebroker_api::Session) with typed
//! folder, file and user operations. [`KiteworksErrorScanner`] teaches the
//! client the server's error envelopes and should be installed on every
//! client that talks to kiteworks.

pub mod models;
pub mod scanner;
pub mod service;

pub use models::{EntryKind, File, Folder, Listing, Metadata, User};
pub use scanner::KiteworksErrorScanner;
pub use service::{FolderContents, Kiteworks};
