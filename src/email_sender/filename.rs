use unicode_normalization::UnicodeNormalization;
use unicode_properties::{GeneralCategory, UnicodeGeneralCategory};

/// Transliterations applied before diacritics are stripped.
/// `Ä` maps through `Á` on purpose: the acute is removed by the mark pass.
const TRANSLITERATIONS: [(char, &str); 8] = [
    ('Ä', "Áe"),
    ('ä', "ae"),
    ('Ö', "Oe"),
    ('ö', "oe"),
    ('Ü', "Ue"),
    ('ü', "ue"),
    ('ß', "ss"),
    ('$', "S"),
];

/// Maps an attachment file name onto a form that survives
/// `Content-Disposition: attachment; filename="..."` on picky MTAs.
///
/// Only the advertised name changes, the file on disk keeps its own.
pub fn normalize(name: &str) -> String {
    let mut transliterated = String::with_capacity(name.len());
    for c in name.chars() {
        match TRANSLITERATIONS.iter().find(|(from, _)| *from == c) {
            Some((_, to)) => transliterated.push_str(to),
            None => transliterated.push(c),
        }
    }

    transliterated
        .nfd()
        .filter(|c| c.general_category() != GeneralCategory::NonspacingMark)
        .nfc()
        .collect()
}
