pub mod config;
pub mod driver;
pub mod error;
pub mod pool;
pub mod pool_manager;
pub mod stub;
pub mod supervisor;
pub mod transport;

pub use error::SandboxError;
pub use stub::Stub;
pub use supervisor::Supervisor;
