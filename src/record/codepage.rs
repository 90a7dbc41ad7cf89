//! 8-bit string decoding by Windows codepage number.

use encoding_rs::Encoding;

/// Encoding for a Windows codepage number, Windows-1252 when unknown.
pub fn encoding_for(codepage: u16) -> &'static Encoding {
    match codepage {
        874   => encoding_rs::WINDOWS_874,
        932   => encoding_rs::SHIFT_JIS,
        936   => encoding_rs::GBK,
        949   => encoding_rs::EUC_KR,
        950   => encoding_rs::BIG5,
        866   => encoding_rs::IBM866,
        1250  => encoding_rs::WINDOWS_1250,
        1251  => encoding_rs::WINDOWS_1251,
        1253  => encoding_rs::WINDOWS_1253,
        1254  => encoding_rs::WINDOWS_1254,
        1255  => encoding_rs::WINDOWS_1255,
        1256  => encoding_rs::WINDOWS_1256,
        1257  => encoding_rs::WINDOWS_1257,
        1258  => encoding_rs::WINDOWS_1258,
        10000 => encoding_rs::MACINTOSH,
        20866 => encoding_rs::KOI8_R,
        21866 => encoding_rs::KOI8_U,
        28592 => encoding_rs::ISO_8859_2,
        28593 => encoding_rs::ISO_8859_3,
        28594 => encoding_rs::ISO_8859_4,
        28595 => encoding_rs::ISO_8859_5,
        28596 => encoding_rs::ISO_8859_6,
        28597 => encoding_rs::ISO_8859_7,
        28598 => encoding_rs::ISO_8859_8,
        28603 => encoding_rs::ISO_8859_13,
        28605 => encoding_rs::ISO_8859_15,
        50220 => encoding_rs::ISO_2022_JP,
        51932 => encoding_rs::EUC_JP,
        54936 => encoding_rs::GB18030,
        65001 => encoding_rs::UTF_8,
        _     => encoding_rs::WINDOWS_1252,
    }
}

/// Decode `bytes`, dropping trailing NULs. Unmappable bytes become U+FFFD.
pub fn decode_codepage(bytes: &[u8], codepage: u16) -> String {
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    let (text, _, _) = encoding_for(codepage).decode(&bytes[..end]);
    text.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codepages() {
        assert_eq!(decode_codepage(b"\xc4\xe5\xed\xfc", 1251), "День");
        assert_eq!(decode_codepage(b"\x82\xa0\0\0", 932), "あ");
        assert_eq!(decode_codepage("ü".as_bytes(), 65001), "ü");
    }

    #[test]
    fn unknown_codepage_falls_back() {
        assert_eq!(decode_codepage(b"\x80", 4711), "€");
        assert_eq!(decode_codepage(b"", 1252), "");
    }
}
