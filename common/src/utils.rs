//! Common Utilities
//! 
//! Provides utility functions used across the RLC workspace

/// Convert a byte slice to hex string for debugging
pub fn bytes_to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Hex dump truncated to `max_len` bytes, for trace logs of large PDUs
pub fn bytes_to_hex_truncated(data: &[u8], max_len: usize) -> String {
    if data.len() <= max_len {
        bytes_to_hex(data)
    } else {
        format!("{} ... ({} bytes)", bytes_to_hex(&data[..max_len]), data.len())
    }
}
