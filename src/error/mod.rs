mod kind;

pub use kind::Error;

pub type Result<T> = std::result::Result<T, Error>;
