//! Invoice identifiers are 128-bit UUIDs internally and 32-byte words on
//! the ledger: the UUID's 16 bytes copied left-aligned, trailing 16 bytes
//! zero.

use uuid::Uuid;

use crate::error::{AppResult, LedgerError};

pub const KEY_LEN: usize = 32;

/// Encode an invoice id as its ledger key
pub fn invoice_key(invoice_id: Uuid) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    key[..16].copy_from_slice(invoice_id.as_bytes());
    key
}

/// Hex form used in submit payloads and logs
pub fn invoice_key_hex(invoice_id: Uuid) -> String {
    let key = invoice_key(invoice_id);
    let mut out = String::with_capacity(2 + KEY_LEN * 2);
    out.push_str("0x");
    for byte in key {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Decode a ledger key back to the invoice id. The trailing 16 bytes must
/// be zero; anything else is not a key this system produced.
pub fn invoice_id(key: &[u8; KEY_LEN]) -> AppResult<Uuid> {
    if key[16..].iter().any(|b| *b != 0) {
        return Err(LedgerError::InvalidKey(format!(
            "non-zero padding in key {key:02x?}"
        ))
        .into());
    }
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&key[..16]);
    Ok(Uuid::from_bytes(bytes))
}

/// Parse a hex key (with or without 0x prefix) into its 32 bytes
pub fn key_from_hex(hex: &str) -> AppResult<[u8; KEY_LEN]> {
    let hex = hex.strip_prefix("0x").unwrap_or(hex);
    if hex.len() != KEY_LEN * 2 {
        return Err(LedgerError::InvalidKey(format!(
            "expected {} hex chars, got {}",
            KEY_LEN * 2,
            hex.len()
        ))
        .into());
    }
    let mut key = [0u8; KEY_LEN];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let s = std::str::from_utf8(chunk)
            .map_err(|_| LedgerError::InvalidKey("non-utf8 hex".into()))?;
        key[i] = u8::from_str_radix(s, 16)
            .map_err(|_| LedgerError::InvalidKey(format!("bad hex byte {s:?}")))?;
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_random_uuids() {
        for _ in 0..10_000 {
            let id = Uuid::new_v4();
            let key = invoice_key(id);
            assert_eq!(invoice_id(&key).unwrap(), id);
        }
    }

    #[test]
    fn test_key_layout() {
        let id = Uuid::parse_str("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();
        let key = invoice_key(id);
        assert_eq!(&key[..16], id.as_bytes());
        assert!(key[16..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_rejects_nonzero_padding() {
        let id = Uuid::new_v4();
        let mut key = invoice_key(id);
        key[31] = 1;
        assert!(invoice_id(&key).is_err());
    }

    #[test]
    fn test_hex_round_trip() {
        let id = Uuid::new_v4();
        let hex = invoice_key_hex(id);
        assert!(hex.starts_with("0x"));
        assert_eq!(hex.len(), 2 + 64);
        let key = key_from_hex(&hex).unwrap();
        assert_eq!(invoice_id(&key).unwrap(), id);
    }

    #[test]
    fn test_hex_rejects_bad_length() {
        assert!(key_from_hex("0xdeadbeef").is_err());
    }
}
