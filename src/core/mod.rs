pub mod logger;
pub mod version;

pub use version::Version;
