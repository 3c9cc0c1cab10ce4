use crate::ConvertError;

/// Encode a u64 as fixed-width big-endian bytes, suitable as an ordered sled key
/// or a metadata value.
pub const fn safe_kv(value: u64) -> [u8; 8] {
    value.to_be_bytes()
}

/// Decode a u64 from fixed-width big-endian bytes.
pub fn safe_vk(bytes: impl AsRef<[u8]>) -> std::result::Result<u64, ConvertError> {
    let bytes = bytes.as_ref();
    let array: [u8; 8] = bytes.try_into().map_err(|_| ConvertError::InvalidLength(bytes.len()))?;
    Ok(u64::from_be_bytes(array))
}
