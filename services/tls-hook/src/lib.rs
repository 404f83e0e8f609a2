pub mod config;
pub mod error;
pub mod hook;
pub mod server;
pub mod tls;

pub use config::{Config, ServerConfig};
pub use error::{ConfigError, ServerError};
pub use hook::{
    classify, DualProtocolListener, DualProtocolStream, HookConfig, HookStats, RecordClass,
    RedirectConfig,
};
pub use server::{ConnectionHandler, HookTlsStream, HttpHandler, Server};
pub use tls::CertificateSource;
