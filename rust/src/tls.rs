use std::sync::Once;

/// Install the ring provider before anything builds a rustls config.
/// `wss://` connections fail without a process-level default provider.
pub fn init_rustls_crypto_provider() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("rustls crypto provider already installed");
        }
    });
}
