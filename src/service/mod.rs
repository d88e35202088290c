pub use app_error::{AppError, AppResult};
pub use config::{
    ConnectionConfig, GeneralConfig, NetworkConfig, RequestHandlerPool, SlowLogConfig,
    TransportConfig, DEFAULT_CHUNK_SIZE,
};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing, verbosity_level};

mod app_error;
mod config;
mod shutdown;
mod tracing_config;
