use lettre::Address;
use validator::validate_email;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientEmail(Address);

impl RecipientEmail {
    /// Trims the raw value and checks it against the mail-address grammar.
    /// The domain part is lowercased; the local part is kept as written.
    ///
    /// Anything accepted here is also accepted by the transport as an
    /// envelope address.
    pub fn parse(s: &str) -> Result<Self, String> {
        let trimmed = s.trim();
        let invalid = || format!("{} is not a valid email address.", trimmed);
        if !validate_email(trimmed) {
            return Err(invalid());
        }

        let normalized = match trimmed.rsplit_once('@') {
            Some((local, domain)) => format!("{}@{}", local, domain.to_lowercase()),
            None => return Err(invalid()),
        };
        normalized.parse().map(Self).map_err(|_| invalid())
    }

    pub fn address(&self) -> &Address {
        &self.0
    }
}

impl AsRef<str> for RecipientEmail {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl std::fmt::Display for RecipientEmail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
