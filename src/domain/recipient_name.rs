#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientName(String);

impl RecipientName {
    /// Returns `None` for an empty or whitespace-only name.
    pub fn parse(name: &str) -> Option<Self> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_owned()))
        }
    }

    /// `"Ana Maria"` with prefix `"certificado_"` becomes `certificado_ana_maria.pdf`.
    ///
    /// Path separators are replaced so that an archive entry never nests
    /// into a directory.
    pub fn certificate_filename(&self, prefix: &str) -> String {
        let stem = self
            .0
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("_")
            .replace(['/', '\\'], "-");
        format!("{}{}.pdf", prefix, stem)
    }
}

impl AsRef<str> for RecipientName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RecipientName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
