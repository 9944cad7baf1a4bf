//! Resource tags.

use crate::resources::Tags;

/// Tag key carrying the technical ID of the owning shoot.
pub const TECHNICAL_ID_TAG: &str = "gardener.cloud/technical-id";

/// Tag key marking VM orchestration groups created for machine sets.
pub const MACHINE_SET_TAG: &str = "machineset.azure.extensions.gardener.cloud";

/// Replaces characters Azure rejects in tag keys and values with `_`.
#[must_use]
pub fn sanitize_tag(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            '<' | '>' | '%' | '\\' | '&' | '?' | '/' | ' ' => '_',
            other => other,
        })
        .collect()
}

/// Tags every object created for a shoot carries.
#[must_use]
pub fn technical_id_tags(technical_id: &str) -> Tags {
    Tags::from([(sanitize_tag(TECHNICAL_ID_TAG), technical_id.to_string())])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_characters_become_underscores() {
        assert_eq!(sanitize_tag("<>%\\&?/a "), "_______a_");
        assert_eq!(sanitize_tag("shoot--dev--a1"), "shoot--dev--a1");
    }

    #[test]
    fn technical_id_tag_key_is_sanitized() {
        let tags = technical_id_tags("shoot--dev--a1");
        assert_eq!(
            tags.get("gardener.cloud_technical-id").map(String::as_str),
            Some("shoot--dev--a1")
        );
    }
}
