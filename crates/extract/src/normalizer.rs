use regex::Regex;

/// Cleans up entity names as returned by the model. Names are identities
/// (entity id == name), so this only strips noise; it never changes case.
pub struct EntityNormalizer {
    surrounding: Regex,
    whitespace: Regex,
}

impl EntityNormalizer {
    pub fn new() -> Self {
        Self {
            surrounding: Regex::new(r#"^[\s"'`*.,;:!?]+|[\s"'`*.,;:!?]+$"#).expect("static regex"),
            whitespace: Regex::new(r"\s+").expect("static regex"),
        }
    }

    /// Trim surrounding quotes/punctuation and collapse inner whitespace
    pub fn normalize(&self, name: &str) -> String {
        let trimmed = self.surrounding.replace_all(name, "");
        self.whitespace.replace_all(&trimmed, " ").to_string()
    }
}

impl Default for EntityNormalizer {
    fn default() -> Self {
        Self::new()
    }
}
