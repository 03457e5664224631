/// Decodes the hex-encoded relay payload. Accepts either case; an empty string
/// is an empty payload.
pub fn decode_hex_payload(payload: &str) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(payload)
}
