//! Registry of upstream network labels and their CAIP-2 chain ids.
//!
//! Upstream x402 providers identify networks by name (`base-sepolia`), while
//! the shielded rail uses `eip155:<id>` CAIP-2 identifiers internally. The
//! codec layer translates between the two before emitting outgoing signature
//! headers and after parsing upstream challenges.

/// `(label, caip2)` pairs for the EVM networks the relayer recognizes.
const KNOWN_NETWORKS: &[(&str, &str)] = &[
    ("base", "eip155:8453"),
    ("base-sepolia", "eip155:84532"),
    ("polygon", "eip155:137"),
    ("polygon-amoy", "eip155:80002"),
    ("avalanche", "eip155:43114"),
    ("avalanche-fuji", "eip155:43113"),
    ("celo", "eip155:42220"),
    ("celo-sepolia", "eip155:11142220"),
];

/// Resolves an upstream network label to its CAIP-2 chain id.
pub fn chain_id_by_label(label: &str) -> Option<&'static str> {
    KNOWN_NETWORKS
        .iter()
        .find(|(name, _)| *name == label)
        .map(|(_, caip2)| *caip2)
}

/// Resolves a CAIP-2 chain id back to the upstream provider label.
pub fn label_by_chain_id(caip2: &str) -> Option<&'static str> {
    KNOWN_NETWORKS
        .iter()
        .find(|(_, id)| *id == caip2)
        .map(|(name, _)| *name)
}

/// Normalizes a network string to CAIP-2: labels are translated, CAIP-2
/// identifiers pass through unchanged.
pub fn to_chain_id(network: &str) -> Option<String> {
    if network.contains(':') {
        return Some(network.to_string());
    }
    chain_id_by_label(network).map(|s| s.to_string())
}

/// Numeric chain reference of an `eip155:<id>` identifier.
pub fn eip155_reference(caip2: &str) -> Option<u64> {
    caip2.strip_prefix("eip155:")?.parse().ok()
}
