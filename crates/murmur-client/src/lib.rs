pub mod access;
pub mod assistant;
pub mod chat_view;
pub mod config;
pub mod directory;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod media;
pub mod pagination;
pub mod presence;
pub mod receipts;
pub mod recording;
pub mod self_destruct;
pub mod session;
pub mod stories;
pub mod subscription;

pub use chat_view::ChatView;
pub use config::ClientConfig;
pub use directory::ChatDirectory;
pub use error::{ClientError, Result};
pub use session::{Backends, IdentityProvider, LocalIdentity, Session};

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("murmur_client=debug,murmur_store=info,warn"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
