//! Sanitization of pod names and label values.
//!
//! Pod names must be valid DNS-1123 labels: lowercase alphanumerics and
//! dashes, at most 63 characters, starting and ending with an
//! alphanumeric. Label values are looser but share the length cap.

/// Maximum length of a DNS-1123 label (and of a label value).
pub const MAX_LABEL_LEN: usize = 63;

/// Sanitize `raw` into a DNS-1123 label capped at [`MAX_LABEL_LEN`].
pub fn dns_label(raw: &str) -> String {
    dns_label_with_limit(raw, MAX_LABEL_LEN)
}

/// Sanitize `raw` into a DNS-1123 label capped at `limit` characters.
/// Lowercases, maps `_` and `.` to `-`, and discards anything else that
/// is not alphanumeric or a dash. Callers composing a name out of several
/// fragments use a tighter limit per fragment so the composite stays
/// within [`MAX_LABEL_LEN`].
pub fn dns_label_with_limit(raw: &str, limit: usize) -> String {
    let mut out = String::with_capacity(raw.len().min(limit));
    for c in raw.chars() {
        if out.len() == limit {
            break;
        }
        let c = c.to_ascii_lowercase();
        match c {
            'a'..='z' | '0'..='9' | '-' => out.push(c),
            '_' | '.' => out.push('-'),
            _ => {}
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "worker".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Sanitize a label value: `/`, `:` and `@` become `-`, and the result is
/// truncated to [`MAX_LABEL_LEN`] characters.
pub fn label_value(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            '/' | ':' | '@' => '-',
            other => other,
        })
        .take(MAX_LABEL_LEN)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_and_maps_separators() {
        assert_eq!(dns_label("Build_Stage.v2"), "build-stage-v2");
    }

    #[test]
    fn strips_invalid_characters() {
        assert_eq!(dns_label("deploy to prod!"), "deploytoprod");
    }

    #[test]
    fn truncates_to_limit() {
        let long = "a".repeat(100);
        assert_eq!(dns_label(&long).len(), MAX_LABEL_LEN);
        assert_eq!(dns_label_with_limit(&long, 10).len(), 10);
    }

    #[test]
    fn trims_leading_and_trailing_dashes() {
        assert_eq!(dns_label("--edge--"), "edge");
    }

    #[test]
    fn empty_input_falls_back() {
        assert_eq!(dns_label("!!!"), "worker");
    }

    #[test]
    fn label_value_replaces_registry_characters() {
        assert_eq!(
            label_value("ghcr.io/acme/builder:1.2@sha256"),
            "ghcr.io-acme-builder-1.2-sha256"
        );
    }

    #[test]
    fn label_value_is_capped() {
        assert_eq!(label_value(&"x".repeat(200)).len(), MAX_LABEL_LEN);
    }
}
