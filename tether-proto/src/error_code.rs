use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Error codes the relay sends back to a device. The wire value is the
/// numeric code as a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The sender's `uid` is unknown to the relay. Devices re-register on
    /// receipt.
    DeviceNotRegistered,
    /// The sender's role may not send this kind of message.
    PermissionDenied,
    /// Fallback for codes this build does not know about.
    ErrorNotFound,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 3] = [
        ErrorCode::DeviceNotRegistered,
        ErrorCode::PermissionDenied,
        ErrorCode::ErrorNotFound,
    ];

    pub fn code(self) -> &'static str {
        match self {
            ErrorCode::DeviceNotRegistered => "1001",
            ErrorCode::PermissionDenied => "5001",
            ErrorCode::ErrorNotFound => "9001",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::DeviceNotRegistered => "DEVICE_NOT_REGISTERED",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::ErrorNotFound => "ERROR_NOT_FOUND",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::DeviceNotRegistered => "Device is not registered.",
            ErrorCode::PermissionDenied => "The action is not allowed.",
            ErrorCode::ErrorNotFound => "The specified code error was not found.",
        }
    }

    /// Look up a code by its wire value. Unknown values map to
    /// [`ErrorCode::ErrorNotFound`].
    pub fn from_code(code: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|c| c.code() == code.trim())
            .unwrap_or(ErrorCode::ErrorNotFound)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.name(), self.code(), self.message())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => ErrorCode::from_code(&s),
            Raw::Number(n) => ErrorCode::from_code(&n.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn lookup_by_code() {
        assert_equal!(ErrorCode::from_code("1001"), ErrorCode::DeviceNotRegistered);
        assert_equal!(ErrorCode::from_code("5001"), ErrorCode::PermissionDenied);
        assert_equal!(ErrorCode::from_code("1234"), ErrorCode::ErrorNotFound);
        assert_equal!(ErrorCode::from_code(""), ErrorCode::ErrorNotFound);
    }

    #[test]
    fn numeric_codes_are_accepted() {
        let code: ErrorCode = serde_json::from_str("5001").unwrap();
        assert_equal!(code, ErrorCode::PermissionDenied);
        let code: ErrorCode = serde_json::from_str("42").unwrap();
        assert_equal!(code, ErrorCode::ErrorNotFound);
        assert!(serde_json::from_str::<ErrorCode>("true").is_err());
    }

    #[test]
    fn serializes_as_string_code() {
        assert_equal!(
            serde_json::to_string(&ErrorCode::DeviceNotRegistered).unwrap(),
            "\"1001\""
        );
    }
}
