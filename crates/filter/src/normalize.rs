use unicode_normalization::UnicodeNormalization;

/// Fold text for case- and accent-insensitive comparison.
///
/// Lowercases, decomposes to NFD, drops combining diacritical marks
/// (U+0300..=U+036F) and trims surrounding whitespace, so `"Bônus "`
/// and `"BONUS"` both become `"bonus"`.
pub fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .nfd()
        .filter(|c| !is_combining_diacritic(*c))
        .collect::<String>()
        .trim()
        .to_string()
}

fn is_combining_diacritic(c: char) -> bool {
    ('\u{0300}'..='\u{036f}').contains(&c)
}
