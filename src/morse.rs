//! Dot/dash symbol translation.
//!
//! Stateless lookup from one letter's worth of symbols to a character.
//! Anything not in the table maps to [`UNKNOWN`].

/// Marker returned for symbol groups that are not in the table.
pub const UNKNOWN: char = '?';

const TABLE: &[(&str, char)] = &[
    (".-", 'A'),
    ("-...", 'B'),
    ("-.-.", 'C'),
    ("-..", 'D'),
    (".", 'E'),
    ("..-.", 'F'),
    ("--.", 'G'),
    ("....", 'H'),
    ("..", 'I'),
    (".---", 'J'),
    ("-.-", 'K'),
    (".-..", 'L'),
    ("--", 'M'),
    ("-.", 'N'),
    ("---", 'O'),
    (".--.", 'P'),
    ("--.-", 'Q'),
    (".-.", 'R'),
    ("...", 'S'),
    ("-", 'T'),
    ("..-", 'U'),
    ("...-", 'V'),
    (".--", 'W'),
    ("-..-", 'X'),
    ("-.--", 'Y'),
    ("--..", 'Z'),
    ("-----", '0'),
    (".----", '1'),
    ("..---", '2'),
    ("...--", '3'),
    ("....-", '4'),
    (".....", '5'),
    ("-....", '6'),
    ("--...", '7'),
    ("---..", '8'),
    ("----.", '9'),
    ("..--.-", '_'),
];

/// Translate one dot/dash group into its character.
pub fn translate(symbols: &str) -> char {
    TABLE
        .iter()
        .find(|(code, _)| *code == symbols)
        .map(|&(_, c)| c)
        .unwrap_or(UNKNOWN)
}

