use alloy::providers::RootProvider;

use paygrid::executor::SettlementExecutor;
use paygrid::SettlementDispatcher;

/// Shared application state, generic over the executor so tests can swap
/// the facilitator for a static one.
pub struct AppState<E: SettlementExecutor> {
    pub dispatcher: SettlementDispatcher<RootProvider, E>,
    /// HMAC shared secret for authenticating /settle calls.
    /// `None` only when the operator explicitly opted out.
    pub shared_secret: Option<Vec<u8>>,
    /// Bearer token for the /metrics endpoint.
    pub metrics_token: Option<Vec<u8>>,
    /// Serve /metrics without a token. Off unless explicitly enabled.
    pub public_metrics: bool,
}
