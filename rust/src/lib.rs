//! Client-side engine for real-time voice/text agent sessions.
//!
//! [`SessionController::spawn`] starts the session actor; the returned
//! [`SessionHandle`] drives it and exposes the [`SessionEvent`] stream.

mod config;
mod error;
mod events;
mod interrupt;
mod logging;
mod registry;
mod send;
mod session;
mod store;
mod tls;
mod transport;

pub use config::EngineConfig;
pub use error::{
    ConnectionError, EngineError, ErrorClass, PeerError, RequestError, SendError,
};
pub use events::{EventError, SessionEvent};
pub use interrupt::{InterruptAck, InterruptCoordinator, InterruptWaiter};
pub use logging::init_logging;
pub use registry::{CompletedResponse, Dispatch, RequestHandlers, RequestRegistry};
pub use send::{Capabilities, FrameSink, SendManager, SessionSettings};
pub use session::{RegisterParams, SessionController, SessionHandle};
pub use store::{
    AesGcmCipher, Cipher, FileStore, KeyValueStore, MemoryStore, SealedStore, StoreError,
    SESSION_ID_KEY,
};
pub use transport::{Transport, TransportConfig, TransportEvent, TransportState, TransportStats};

pub use parla_media as media;
pub use parla_protocol as protocol;

// Used by binaries/tests that dial wss:// before a session exists.
pub fn init_rustls_crypto_provider() {
    tls::init_rustls_crypto_provider();
}
