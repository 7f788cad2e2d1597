//! Serialization traits for payloads carried inside a frame.

use super::FrameError;

/// An interface for serializable payload types.
///
/// See also [`FromBytes`] for deserialization.
pub trait ToBytes {
    /// The length of the buffer for encoding the type.
    fn buffer_length(&self) -> usize;

    /// Serialize the type in the given buffer.
    ///
    /// # Panics
    /// This method may panic if the given buffer is too small. Thus, [`buffer_length()`] must be
    /// called prior to calling this, and a large enough buffer must be provided.
    ///
    /// [`buffer_length()`]: #method.buffer_length
    fn to_bytes<T: AsMut<[u8]>>(&self, buffer: &mut T);

    /// Serialize the type into a freshly allocated buffer.
    fn to_vec(&self) -> Vec<u8> {
        let mut buffer = vec![0_u8; self.buffer_length()];
        self.to_bytes(&mut buffer);
        buffer
    }
}

/// An interface for deserializable payload types.
///
/// See also [`ToBytes`] for serialization.
pub trait FromBytes: Sized {
    /// Deserialize the type from the given buffer.
    ///
    /// # Errors
    /// Fails with [`FrameError::Malformed`] if the buffer does not hold exactly one valid value.
    fn from_bytes<T: AsRef<[u8]> + ?Sized>(buffer: &T) -> Result<Self, FrameError>;
}
