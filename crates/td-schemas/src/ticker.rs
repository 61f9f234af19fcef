use std::fmt;

/// An opaque symbol string, canonicalized (uppercased, trimmed) before any
/// comparison or use as a map key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ticker(String);

#[derive(Debug, thiserror::Error)]
pub enum TickerError {
    #[error("ticker must be 1-8 characters, got '{0}'")]
    BadLength(String),
    #[error("ticker must be alphanumeric, got '{0}'")]
    BadChars(String),
}

impl Ticker {
    pub fn new(raw: &str) -> Result<Self, TickerError> {
        let canon = raw.trim().to_ascii_uppercase();
        if canon.is_empty() || canon.len() > 8 {
            return Err(TickerError::BadLength(canon));
        }
        if !canon.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(TickerError::BadChars(canon));
        }
        Ok(Ticker(canon))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Ticker {
    type Error = TickerError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Ticker::new(&value)
    }
}

impl From<Ticker> for String {
    fn from(t: Ticker) -> String {
        t.0
    }
}

impl fmt::Display for Ticker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_case_and_whitespace() {
        let t = Ticker::new(" aapl ").unwrap();
        assert_eq!(t.as_str(), "AAPL");
    }

    #[test]
    fn rejects_too_long() {
        assert!(Ticker::new("TOOLONGSYM").is_err());
    }

    #[test]
    fn rejects_non_alphanumeric() {
        assert!(Ticker::new("AA-PL").is_err());
    }
}
