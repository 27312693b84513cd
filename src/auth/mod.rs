mod authenticator;
mod credentials;

pub use authenticator::Authenticator;
pub use credentials::Credentials;
