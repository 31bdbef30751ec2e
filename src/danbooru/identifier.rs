use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Error returned when an identifier string cannot be understood.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("Unknown identifier kind: {0}")]
    UnknownKind(String),

    #[error("Invalid numeric id: {0}")]
    InvalidId(String),

    #[error("Artist tag must not be empty")]
    EmptyArtist,
}

/// A target the caller wants fetched.
///
/// Direct post ids resolve to exactly one request; pools and artist tag queries resolve to a listing
/// that is expanded into post ids before any post request is made.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    Post(u64),
    Pool(u64),
    Artist(String),
}

impl Identifier {
    /// Short human readable label, used as a folder name by the front-end.
    pub fn label(&self) -> String {
        match self {
            Identifier::Post(_) => "posts".to_string(),
            Identifier::Pool(id) => format!("pool_{}", id),
            Identifier::Artist(tag) => tag.clone(),
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Post(id) => write!(f, "post:{}", id),
            Identifier::Pool(id) => write!(f, "pool:{}", id),
            Identifier::Artist(tag) => write!(f, "artist:{}", tag),
        }
    }
}

fn parse_id(value: &str) -> Result<u64, IdentifierError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| IdentifierError::InvalidId(value.to_string()))
}

impl FromStr for Identifier {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let Some((kind, value)) = s.split_once(':') else {
            // A bare number is the common case of pasting a post id.
            return parse_id(s).map(Identifier::Post);
        };

        match kind.to_ascii_lowercase().as_str() {
            "post" => parse_id(value).map(Identifier::Post),
            "pool" => parse_id(value).map(Identifier::Pool),
            "artist" => {
                let tag = value.trim();
                if tag.is_empty() {
                    Err(IdentifierError::EmptyArtist)
                } else {
                    Ok(Identifier::Artist(tag.to_string()))
                }
            }
            other => Err(IdentifierError::UnknownKind(other.to_string())),
        }
    }
}
