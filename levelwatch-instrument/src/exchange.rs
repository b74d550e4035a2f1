use serde::{Deserialize, Serialize};

/// Unique identifier for a broker exchange segment.
///
/// ### Notes
/// The broker routes equity and derivative instruments through distinct segments,
/// so the same underlying may exist under several `Exchange` variants with
/// different tokens.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Exchange {
    /// National Stock Exchange cash segment.
    Nse,
    /// Bombay Stock Exchange cash segment.
    Bse,
    /// NSE futures & options segment.
    Nfo,
    /// BSE futures & options segment.
    Bfo,
    /// Multi Commodity Exchange.
    Mcx,
    /// Currency derivatives segment.
    Cds,
}

impl Exchange {
    /// Stable wire identifier used by the broker protocol and the scrip master.
    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Nse => "NSE",
            Exchange::Bse => "BSE",
            Exchange::Nfo => "NFO",
            Exchange::Bfo => "BFO",
            Exchange::Mcx => "MCX",
            Exchange::Cds => "CDS",
        }
    }

    /// Numeric segment code carried in binary quote packets.
    pub fn segment_code(&self) -> u8 {
        match self {
            Exchange::Nse => 1,
            Exchange::Bse => 2,
            Exchange::Nfo => 3,
            Exchange::Bfo => 4,
            Exchange::Mcx => 5,
            Exchange::Cds => 6,
        }
    }

    /// Inverse of [`Exchange::segment_code`].
    pub fn from_segment_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Exchange::Nse),
            2 => Some(Exchange::Bse),
            3 => Some(Exchange::Nfo),
            4 => Some(Exchange::Bfo),
            5 => Some(Exchange::Mcx),
            6 => Some(Exchange::Cds),
            _ => None,
        }
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Exchange {
    type Err = UnknownExchange;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NSE" => Ok(Exchange::Nse),
            "BSE" => Ok(Exchange::Bse),
            "NFO" => Ok(Exchange::Nfo),
            "BFO" => Ok(Exchange::Bfo),
            "MCX" => Ok(Exchange::Mcx),
            "CDS" => Ok(Exchange::Cds),
            other => Err(UnknownExchange(other.to_string())),
        }
    }
}

/// Error returned when parsing an unrecognised exchange segment identifier.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UnknownExchange(pub String);

impl std::fmt::Display for UnknownExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown exchange segment: {}", self.0)
    }
}

impl std::error::Error for UnknownExchange {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_segment_code_round_trip() {
        for exchange in [
            Exchange::Nse,
            Exchange::Bse,
            Exchange::Nfo,
            Exchange::Bfo,
            Exchange::Mcx,
            Exchange::Cds,
        ] {
            assert_eq!(
                Exchange::from_segment_code(exchange.segment_code()),
                Some(exchange)
            );
        }
        assert_eq!(Exchange::from_segment_code(0), None);
        assert_eq!(Exchange::from_segment_code(7), None);
    }

    #[test]
    fn test_exchange_de() {
        let actual = serde_json::from_str::<Exchange>(r#""NSE""#).unwrap();
        assert_eq!(actual, Exchange::Nse);
        assert!("NSE".parse::<Exchange>().is_ok());
        assert!("XNSE".parse::<Exchange>().is_err());
    }
}
