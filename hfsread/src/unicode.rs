//! HFS+ Unicode handling.
//!
//! Names are stored on disk as UTF-16BE, fully decomposed per Apple's
//! variant of NFD: canonical decomposition and combining-class reordering
//! apply only to U+0000..U+FFFF excluding U+2000..U+2FFF and
//! U+F900..U+FAFF. HFSX (case-sensitive) compares code units binary;
//! HFS+ compares with the TN1150 case-folding order, where code points
//! folding to zero are ignored entirely.

use std::cmp::Ordering;

use unicode_normalization::char::{canonical_combining_class, decompose_canonical};

use crate::error::{HfsError, Result};

/// Maximum HFS+ name length in UTF-16 code units.
pub const MAX_NAME_UNITS: usize = 255;

/// Convert a UTF-16BE byte slice to code units.
pub fn utf16be_to_u16(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
        .collect()
}

/// Decode UTF-16 code units strictly; unpaired surrogates are an error.
pub fn utf16_to_string(units: &[u16]) -> Result<String> {
    char::decode_utf16(units.iter().copied())
        .collect::<std::result::Result<String, _>>()
        .map_err(|_| HfsError::InvalidName("unpaired surrogate in name".into()))
}

/// Decode UTF-16 code units, substituting U+FFFD for unpaired surrogates.
pub fn utf16_to_string_lossy(units: &[u16]) -> String {
    String::from_utf16_lossy(units)
}

/// Encode a string to UTF-16 code units, enforcing the HFS+ length bound.
pub fn string_to_utf16(s: &str) -> Result<Vec<u16>> {
    let units: Vec<u16> = s.encode_utf16().collect();
    if units.len() > MAX_NAME_UNITS {
        return Err(HfsError::InvalidName(format!(
            "name exceeds {MAX_NAME_UNITS} UTF-16 units"
        )));
    }
    Ok(units)
}

/// Map an on-disk name to its UNIX form: HFS+ stores ':' as the path
/// separator internally, so a literal '/' on disk surfaces as ':'.
pub fn name_to_unix(name: &str) -> String {
    name.replace('/', ":")
}

/// Map a UNIX path element back to its on-disk form.
pub fn unix_to_name(element: &str) -> String {
    element.replace(':', "/")
}

fn in_decomposition_range(c: char) -> bool {
    let v = c as u32;
    v <= 0xFFFF && !(0x2000..=0x2FFF).contains(&v) && !(0xF900..=0xFAFF).contains(&v)
}

/// Apple-variant NFD. Codepoints outside the decomposition range pass
/// through untouched and act as barriers for combining-class reordering.
/// Name comparisons on disk depend on this exact behavior.
pub fn hfs_nfd(input: &str) -> String {
    let mut out: Vec<char> = Vec::with_capacity(input.chars().count());
    for c in input.chars() {
        if in_decomposition_range(c) {
            decompose_canonical(c, |d| out.push(d));
        } else {
            out.push(c);
        }
    }

    // Canonical ordering: stable-sort runs of nonzero combining class.
    // Out-of-range codepoints count as class 0 and end the run.
    let class = |c: char| -> u8 {
        if in_decomposition_range(c) {
            canonical_combining_class(c)
        } else {
            0
        }
    };
    let mut i = 1;
    while i < out.len() {
        let prev = class(out[i - 1]);
        let cur = class(out[i]);
        if cur != 0 && prev > cur {
            out.swap(i - 1, i);
            if i > 1 {
                i -= 1;
                continue;
            }
        }
        i += 1;
    }
    out.into_iter().collect()
}

/// Compare two names binary (HFSX / case-sensitive volumes).
pub fn compare_binary(a: &[u16], b: &[u16]) -> Ordering {
    let len = a.len().min(b.len());
    for i in 0..len {
        match a[i].cmp(&b[i]) {
            Ordering::Equal => continue,
            ord => return ord,
        }
    }
    a.len().cmp(&b.len())
}

/// Case-folding table for the HFS+ comparison order (TN1150).
/// Only entries that differ from identity are listed; algorithmic ranges
/// (Latin-1, Greek, Cyrillic) are handled in `case_fold`.
static CASE_FOLD: &[(u16, u16)] = &[
    (0x0100, 0x0101), // Ā -> ā
    (0x0102, 0x0103), // Ă -> ă
    (0x0104, 0x0105), // Ą -> ą
    (0x0106, 0x0107), // Ć -> ć
    (0x0108, 0x0109), // Ĉ -> ĉ
    (0x010A, 0x010B), // Ċ -> ċ
    (0x010C, 0x010D), // Č -> č
    (0x010E, 0x010F), // Ď -> ď
    (0x0110, 0x0111), // Đ -> đ
    (0x0112, 0x0113), // Ē -> ē
    (0x0114, 0x0115), // Ĕ -> ĕ
    (0x0116, 0x0117), // Ė -> ė
    (0x0118, 0x0119), // Ę -> ę
    (0x011A, 0x011B), // Ě -> ě
    (0x011C, 0x011D), // Ĝ -> ĝ
    (0x011E, 0x011F), // Ğ -> ğ
    (0x0120, 0x0121), // Ġ -> ġ
    (0x0122, 0x0123), // Ģ -> ģ
    (0x0124, 0x0125), // Ĥ -> ĥ
    (0x0126, 0x0127), // Ħ -> ħ
    (0x0128, 0x0129), // Ĩ -> ĩ
    (0x012A, 0x012B), // Ī -> ī
    (0x012C, 0x012D), // Ĭ -> ĭ
    (0x012E, 0x012F), // Į -> į
    (0x0130, 0x0069), // İ -> i
    (0x0132, 0x0133), // Ĳ -> ĳ
    (0x0134, 0x0135), // Ĵ -> ĵ
    (0x0136, 0x0137), // Ķ -> ķ
    (0x0139, 0x013A), // Ĺ -> ĺ
    (0x013B, 0x013C), // Ļ -> ļ
    (0x013D, 0x013E), // Ľ -> ľ
    (0x013F, 0x0140), // Ŀ -> ŀ
    (0x0141, 0x0142), // Ł -> ł
    (0x0143, 0x0144), // Ń -> ń
    (0x0145, 0x0146), // Ņ -> ņ
    (0x0147, 0x0148), // Ň -> ň
    (0x014A, 0x014B), // Ŋ -> ŋ
    (0x014C, 0x014D), // Ō -> ō
    (0x014E, 0x014F), // Ŏ -> ŏ
    (0x0150, 0x0151), // Ő -> ő
    (0x0152, 0x0153), // Œ -> œ
    (0x0154, 0x0155), // Ŕ -> ŕ
    (0x0156, 0x0157), // Ŗ -> ŗ
    (0x0158, 0x0159), // Ř -> ř
    (0x015A, 0x015B), // Ś -> ś
    (0x015C, 0x015D), // Ŝ -> ŝ
    (0x015E, 0x015F), // Ş -> ş
    (0x0160, 0x0161), // Š -> š
    (0x0162, 0x0163), // Ţ -> ţ
    (0x0164, 0x0165), // Ť -> ť
    (0x0166, 0x0167), // Ŧ -> ŧ
    (0x0168, 0x0169), // Ũ -> ũ
    (0x016A, 0x016B), // Ū -> ū
    (0x016C, 0x016D), // Ŭ -> ŭ
    (0x016E, 0x016F), // Ů -> ů
    (0x0170, 0x0171), // Ű -> ű
    (0x0172, 0x0173), // Ų -> ų
    (0x0174, 0x0175), // Ŵ -> ŵ
    (0x0176, 0x0177), // Ŷ -> ŷ
    (0x0178, 0x00FF), // Ÿ -> ÿ
    (0x0179, 0x017A), // Ź -> ź
    (0x017B, 0x017C), // Ż -> ż
    (0x017D, 0x017E), // Ž -> ž
];

/// Fold one code unit for comparison. Zero means the code point is
/// ignorable and contributes nothing to the ordering.
fn case_fold(c: u16) -> u16 {
    match c {
        // Ignorables per TN1150: NUL, zero-width and directional marks, BOM.
        0x0000 => 0,
        0x200C..=0x200F | 0x202A..=0x202E | 0x206A..=0x206F | 0xFEFF => 0,
        // ASCII and Latin-1 capitals.
        0x0041..=0x005A => c + 0x20,
        0x00C0..=0x00D6 | 0x00D8..=0x00DE => c + 0x20,
        // Greek capitals (0x03A2 is unassigned).
        0x0391..=0x03A1 | 0x03A3..=0x03AB => c + 0x20,
        // Cyrillic.
        0x0400..=0x040F => c + 0x50,
        0x0410..=0x042F => c + 0x20,
        _ => match CASE_FOLD.binary_search_by_key(&c, |&(from, _)| from) {
            Ok(idx) => CASE_FOLD[idx].1,
            Err(_) => c,
        },
    }
}

/// Compare two names with the HFS+ case-folding order, skipping
/// ignorable code points on both sides.
pub fn compare_folded(a: &[u16], b: &[u16]) -> Ordering {
    let mut ai = a.iter().copied().map(case_fold).filter(|&c| c != 0);
    let mut bi = b.iter().copied().map(case_fold).filter(|&c| c != 0);
    loop {
        match (ai.next(), bi.next()) {
            (Some(ca), Some(cb)) => match ca.cmp(&cb) {
                Ordering::Equal => continue,
                ord => return ord,
            },
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
        }
    }
}
