// RE-EXPORTS
// ================================================================================================

pub use winter_utils::{
    ByteReader, ByteWriter, Deserializable, DeserializationError, Serializable, SliceReader,
};

/// Writes a length-prefixed byte blob.
pub fn write_blob<W: ByteWriter>(target: &mut W, bytes: &[u8]) {
    target.write_u32(bytes.len() as u32);
    target.write_bytes(bytes);
}

/// Reads a length-prefixed byte blob written by [`write_blob`].
pub fn read_blob<R: ByteReader>(source: &mut R) -> Result<Vec<u8>, DeserializationError> {
    let len = source.read_u32()? as usize;
    source.read_vec(len)
}

/// Writes a UTF-8 string as a length-prefixed blob.
pub fn write_string<W: ByteWriter>(target: &mut W, value: &str) {
    write_blob(target, value.as_bytes());
}

/// Reads a UTF-8 string written by [`write_string`].
pub fn read_string<R: ByteReader>(source: &mut R) -> Result<String, DeserializationError> {
    let bytes = read_blob(source)?;
    String::from_utf8(bytes)
        .map_err(|err| DeserializationError::InvalidValue(format!("invalid utf-8 string: {err}")))
}
