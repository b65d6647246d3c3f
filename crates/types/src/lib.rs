//! Validated primitive types shared across the enrolment crates.
//!
//! These wrappers are constructed once at the edge (user input, snapshot restore) and then
//! carried through the engine, so downstream code never re-checks phone syntax.

/// Errors that can occur when creating validated text types.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TextError {
    /// The input text was empty or contained only whitespace
    #[error("Text cannot be empty")]
    Empty,

    /// The input could not be read as a phone number
    #[error("Invalid phone number: {0}")]
    InvalidPhone(String),
}

/// A reachable phone number in normalised form.
///
/// Spaces, hyphens, dots and parentheses are stripped during parsing. The result is an
/// optional leading `+` followed by 7 to 15 digits (the E.164 upper bound).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    const MIN_DIGITS: usize = 7;
    const MAX_DIGITS: usize = 15;

    /// Parses and normalises a phone number.
    ///
    /// # Errors
    ///
    /// Returns [`TextError::Empty`] for blank input, or [`TextError::InvalidPhone`] if the
    /// input contains other characters or the digit count is out of range.
    pub fn parse(input: impl AsRef<str>) -> Result<Self, TextError> {
        let raw = input.as_ref().trim();
        if raw.is_empty() {
            return Err(TextError::Empty);
        }

        let (plus, rest) = match raw.strip_prefix('+') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };

        let mut digits = String::with_capacity(rest.len());
        for c in rest.chars() {
            match c {
                '0'..='9' => digits.push(c),
                ' ' | '-' | '.' | '(' | ')' => {}
                _ => return Err(TextError::InvalidPhone(raw.to_owned())),
            }
        }

        if !(Self::MIN_DIGITS..=Self::MAX_DIGITS).contains(&digits.len()) {
            return Err(TextError::InvalidPhone(raw.to_owned()));
        }

        if plus {
            digits.insert(0, '+');
        }
        Ok(Self(digits))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the number with all but the last four digits hidden, for log fields.
    pub fn masked(&self) -> String {
        let keep = 4.min(self.0.len());
        let (head, tail) = self.0.split_at(self.0.len() - keep);
        let hidden: String = head
            .chars()
            .map(|c| if c.is_ascii_digit() { '*' } else { c })
            .collect();
        format!("{hidden}{tail}")
    }
}

impl std::fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl serde::Serialize for PhoneNumber {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for PhoneNumber {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        PhoneNumber::parse(&s).map_err(serde::de::Error::custom)
    }
}
