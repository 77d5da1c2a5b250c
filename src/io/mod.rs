//! Remote services: authentication, Earth Engine exports and Drive retrieval

pub mod auth;
pub mod drive;
pub mod earth_engine;
pub mod locator;

// Re-export main types
pub use auth::{credentials_from_config, AuthorizedUserCredentials, CredentialProvider, StaticToken};
pub use drive::{DriveClient, FilePage, FileQuery, RemoteEntry, RemoteStorage};
pub use earth_engine::{EarthEngineClient, Operation};
pub use locator::ArtifactLocator;
