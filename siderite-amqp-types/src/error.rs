//! Errors raised while encoding or decoding wire types

/// Error encoding a value into a buffer
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// A short string exceeded the 255 byte wire limit
    #[error("Short string of {0} bytes exceeds 255 bytes")]
    ShortStringTooLong(usize),
}

/// Error decoding a value out of a buffer
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The buffer ended before the value was complete
    #[error("Buffer too short for a complete value")]
    Incomplete,

    /// A string field was not valid UTF-8
    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    /// An unknown field-value kind octet was found in a field table
    #[error("Unknown field value kind {0:#x}")]
    UnknownFieldKind(u8),

    /// A class or method id that this implementation does not know
    #[error("Unknown method {class_id}.{method_id}")]
    UnknownMethod {
        /// Class id found on the wire
        class_id: u16,
        /// Method id found on the wire
        method_id: u16,
    },

    /// A content header carried an unexpected class id
    #[error("Unexpected content header class {0}")]
    UnexpectedContentClass(u16),
}

impl From<std::string::FromUtf8Error> for DecodeError {
    fn from(_: std::string::FromUtf8Error) -> Self {
        Self::InvalidUtf8
    }
}
