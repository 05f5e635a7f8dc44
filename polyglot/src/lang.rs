//! Language identifier normalization.
//!
//! Callers hand in whatever they have (BCP 47-ish short codes, script
//! variants, already-canonical engine tags); [`canonicalize`] maps them to
//! the translation engine's canonical tags. Unknown codes pass through
//! unchanged so the engine can reject them with its own error instead of
//! this layer guessing.

/// Intermediate language used for pivot translation.
pub const PIVOT_LANG: &str = "eng_Latn";

/// Canonical engine tags this deployment ships models for.
pub const SUPPORTED_TAGS: &[&str] = &[
    "eng_Latn",
    "zho_Hans",
    "zho_Hant",
    "khk_Cyrl",
    "mon_Mong",
];

/// Map a caller-supplied language code to the engine's canonical tag.
///
/// Matching is case-insensitive and treats `-` and `_` the same, so
/// `zh-CN`, `zh_cn`, and `zho_Hans` all resolve to `zho_Hans`. Codes with
/// no table entry are returned as-is (identity fallback; this function
/// never fails).
pub fn canonicalize(code: &str) -> &str {
    let key: String = code
        .chars()
        .map(|c| if c == '-' { '_' } else { c.to_ascii_lowercase() })
        .collect();
    match key.as_str() {
        "en" | "eng" | "en_us" | "en_gb" | "eng_latn" => "eng_Latn",
        "zh" | "zh_cn" | "zh_hans" | "zho_hans" | "cmn_hans" => "zho_Hans",
        "zh_tw" | "zh_hant" | "zho_hant" | "cmn_hant" => "zho_Hant",
        "mn" | "mn_cyrl" | "mon_cyrl" | "khk_cyrl" => "khk_Cyrl",
        "mn_mong" | "mon_mong" => "mon_Mong",
        _ => code,
    }
}

/// Whether the code resolves to a tag this deployment ships models for.
pub fn is_supported(code: &str) -> bool {
    SUPPORTED_TAGS.contains(&canonicalize(code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_codes_resolve_to_engine_tags() {
        assert_eq!(canonicalize("en"), "eng_Latn");
        assert_eq!(canonicalize("zh"), "zho_Hans");
        assert_eq!(canonicalize("mn"), "khk_Cyrl");
    }

    #[test]
    fn separators_and_case_are_folded() {
        assert_eq!(canonicalize("zh-CN"), "zho_Hans");
        assert_eq!(canonicalize("ZH_TW"), "zho_Hant");
        assert_eq!(canonicalize("mn-Mong"), "mon_Mong");
        assert_eq!(canonicalize("Mon_Cyrl"), "khk_Cyrl");
    }

    #[test]
    fn canonical_tags_are_fixed_points() {
        for tag in SUPPORTED_TAGS {
            assert_eq!(canonicalize(tag), *tag);
        }
    }

    #[test]
    fn unknown_codes_pass_through_untouched() {
        assert_eq!(canonicalize("fra_Latn"), "fra_Latn");
        assert_eq!(canonicalize("xx"), "xx");
        assert!(!is_supported("fra_Latn"));
    }

    #[test]
    fn pivot_is_a_supported_tag() {
        assert!(is_supported(PIVOT_LANG));
    }
}
