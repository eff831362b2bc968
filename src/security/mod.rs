pub mod credentials;

pub use credentials::{CredentialStore, PASSWORD_ENV};
