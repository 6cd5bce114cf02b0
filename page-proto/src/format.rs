//! Removal of in-band formatting codes from message text.

/// Starts a color sequence: `F` plus two digits, or just two digits
pub const COLOR: char = '\x19';
/// Attribute start, optionally followed by an attribute character
pub const SET_ATTR: char = '\x1a';
/// Attribute end, optionally followed by an attribute character
pub const REMOVE_ATTR: char = '\x1b';
/// Soft reset
pub const RESET: char = '\x1c';

const ATTRIBUTES: [char; 5] = ['*', '!', '/', '_', '|'];

/// Text with recognized formatting removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stripped {
    pub text: String,
    /// Control characters left in `text` that matched no known sequence
    pub unknown: Vec<char>,
}

impl Stripped {
    pub fn is_clean(&self) -> bool {
        self.unknown.is_empty()
    }
}

pub fn strip_formatting(input: &str) -> Stripped {
    let chars: Vec<char> = input.chars().collect();
    let mut text = String::with_capacity(input.len());
    let mut unknown = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let rest = &chars[i + 1..];
        let digit = |k: usize| rest.get(k).is_some_and(|c| c.is_ascii_digit());

        match c {
            COLOR if rest.first() == Some(&'F') && digit(1) && digit(2) => i += 4,
            COLOR if digit(0) && digit(1) => i += 3,
            SET_ATTR | REMOVE_ATTR => {
                let has_attr = rest.first().is_some_and(|a| ATTRIBUTES.contains(a));
                i += if has_attr { 2 } else { 1 };
            }
            RESET => i += 1,
            COLOR => {
                unknown.push(c);
                text.push(c);
                i += 1;
            }
            _ => {
                text.push(c);
                i += 1;
            }
        }
    }

    Stripped { text, unknown }
}
