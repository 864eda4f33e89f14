use alloy::primitives::Address;

/// Base mainnet chain ID.
pub const BASE_CHAIN_ID: u64 = 8453;

/// CAIP-2 network identifier for Base mainnet.
pub const BASE_NETWORK: &str = "eip155:8453";

/// USDC token address on Base mainnet.
pub const USDC_ADDRESS: Address = Address::new([
    0x83, 0x35, 0x89, 0xfc, 0xd6, 0xed, 0xb6, 0xe0, 0x8f, 0x4c, 0x7c, 0x32, 0xd4, 0xf7, 0x1b, 0x54,
    0xbd, 0xa0, 0x29, 0x13,
]);

/// USDC has 6 decimal places; budget arithmetic uses the same micro-USD scale.
pub const USDC_DECIMALS: u32 = 6;

/// Default RPC endpoint for Base mainnet.
pub const RPC_URL: &str = "https://mainnet.base.org";

/// Accepted deviation between the requested amount and an on-chain transfer,
/// in basis points of the requested amount.
pub const AMOUNT_TOLERANCE_BPS: u64 = 10;

/// Confirmation depth an on-chain transfer needs before it settles a request.
pub const MIN_CONFIRMATIONS: u64 = 1;

/// Runtime chain configuration. Decouples verification from compile-time
/// constants so the router can run against other EVM chains and assets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub network: String,
    pub asset: Address,
    pub asset_symbol: String,
    pub asset_decimals: u32,
    pub rpc_url: String,
    pub eip712_domain_name: String,
    pub eip712_domain_version: String,
    pub min_confirmations: u64,
}

impl Default for ChainConfig {
    /// Defaults to USDC on Base. The EIP-3009 domain for USDC is
    /// name "USD Coin", version "2", verifying contract = token address.
    fn default() -> Self {
        Self {
            chain_id: BASE_CHAIN_ID,
            network: BASE_NETWORK.to_string(),
            asset: USDC_ADDRESS,
            asset_symbol: "USDC".to_string(),
            asset_decimals: USDC_DECIMALS,
            rpc_url: RPC_URL.to_string(),
            eip712_domain_name: "USD Coin".to_string(),
            eip712_domain_version: "2".to_string(),
            min_confirmations: MIN_CONFIRMATIONS,
        }
    }
}
