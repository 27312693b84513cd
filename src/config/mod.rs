mod options;

pub use options::{ClientOptions, ClientOptionsBuilder};
