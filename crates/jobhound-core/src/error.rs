use serde::Serialize;

/// How a failure should be treated by whoever receives it.
///
/// Every module error maps onto one of these through a `kind()` method, so the
/// scheduler and the HTTP layer can decide between retrying, reporting and
/// surfacing a conflict without matching on each concrete error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unknown entity id. Reported, never retried.
    NotFound,
    /// Malformed pattern, endpoint or config. Reported, never retried.
    #[serde(rename = "validation_error")]
    Validation,
    /// Network or provider hiccup. Retried with backoff up to a bound.
    #[serde(rename = "transient_io_error")]
    TransientIo,
    /// The delivery endpoint rejected the request. Not retried.
    #[serde(rename = "permanent_delivery_error")]
    PermanentDelivery,
    /// Another writer changed the entity first.
    Conflict,
    /// Storage or decoding fault.
    #[serde(rename = "internal_error")]
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Validation => "validation_error",
            ErrorKind::TransientIo => "transient_io_error",
            ErrorKind::PermanentDelivery => "permanent_delivery_error",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Internal => "internal_error",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::TransientIo)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_io_is_retryable() {
        let retryable: Vec<_> = [
            ErrorKind::NotFound,
            ErrorKind::Validation,
            ErrorKind::TransientIo,
            ErrorKind::PermanentDelivery,
            ErrorKind::Conflict,
            ErrorKind::Internal,
        ]
        .into_iter()
        .filter(ErrorKind::is_retryable)
        .collect();
        assert_eq!(retryable, vec![ErrorKind::TransientIo]);
    }

    #[test]
    fn serialized_name_matches_as_str() {
        for kind in [
            ErrorKind::NotFound,
            ErrorKind::Validation,
            ErrorKind::TransientIo,
            ErrorKind::PermanentDelivery,
            ErrorKind::Conflict,
            ErrorKind::Internal,
        ] {
            let value = serde_json::to_value(kind).expect("serialize");
            assert_eq!(value, kind.as_str());
        }
        assert_eq!(
            serde_json::to_value(ErrorKind::PermanentDelivery).expect("serialize"),
            "permanent_delivery_error"
        );
    }
}
