mod error;
mod stream;
mod tls;

pub use error::TlsError;
pub use stream::{BoxedStream, TunnelStream};
pub use tls::{
    load_client_config_from_pem, load_server_config, load_server_config_from_pem,
};
