//! Properties this deployment synchronizes, and their channel-side ids

use std::collections::BTreeMap;

use super::ConfigError;

/// `property_id -> external_property_id`, parsed from
/// `p1:H-42,p2:H-43`. An entry without `:` uses the same id on both sides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyDirectory {
    entries: BTreeMap<String, String>,
}

impl PropertyDirectory {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let mut directory = Self::default();
        for entry in raw.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
            let (local, external) = entry.split_once(':').unwrap_or((entry, entry));
            let (local, external) = (local.trim(), external.trim());
            if local.is_empty() || external.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "INNSYNC_PROPERTIES entry `{entry}` must be property_id[:external_property_id]"
                )));
            }
            directory.insert(local, external)?;
        }
        Ok(directory)
    }

    pub fn insert(
        &mut self,
        property_id: &str,
        external_property_id: &str,
    ) -> Result<(), ConfigError> {
        if self.external_id(property_id).is_some() {
            return Err(ConfigError::Invalid(format!(
                "property `{property_id}` is listed twice"
            )));
        }
        if self.property_for_external(external_property_id).is_some() {
            return Err(ConfigError::Invalid(format!(
                "external property `{external_property_id}` is listed twice"
            )));
        }
        self.entries
            .insert(property_id.to_string(), external_property_id.to_string());
        Ok(())
    }

    #[must_use]
    pub fn with(mut self, property_id: &str, external_property_id: &str) -> Self {
        self.entries
            .insert(property_id.to_string(), external_property_id.to_string());
        self
    }

    pub fn external_id(&self, property_id: &str) -> Option<&str> {
        self.entries.get(property_id).map(String::as_str)
    }

    /// Reverse lookup for webhooks, which only name the channel-side property
    pub fn property_for_external(&self, external_property_id: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, external)| external.as_str() == external_property_id)
            .map(|(local, _)| local.as_str())
    }

    pub fn property_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pairs_and_bare_ids() {
        let directory = PropertyDirectory::parse(" p1:H-42 , p2 ,").unwrap();
        assert_eq!(directory.len(), 2);
        assert_eq!(directory.external_id("p1"), Some("H-42"));
        assert_eq!(directory.external_id("p2"), Some("p2"));
        assert_eq!(directory.property_for_external("H-42"), Some("p1"));
        assert_eq!(directory.property_for_external("H-99"), None);
    }

    #[test]
    fn rejects_duplicates_and_blanks() {
        assert!(PropertyDirectory::parse("p1:H-1,p1:H-2").is_err());
        assert!(PropertyDirectory::parse("p1:H-1,p2:H-1").is_err());
        assert!(PropertyDirectory::parse("p1:").is_err());
    }
}
