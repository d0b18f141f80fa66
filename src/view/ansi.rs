use once_cell::sync::Lazy;
use regex::Regex;

/// Control Sequence Introducer: colors, cursor movement, erase
static RE_CSI: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]").unwrap());

/// Operating System Commands: window titles, hyperlinks
static RE_OSC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\][^\x07\x1b]*(\x07|\x1b\\)").unwrap());

/// Remaining two-byte escapes (charset selection, keypad modes)
static RE_ESC: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b[()][0-9A-Za-z]|\x1b[=>78DEHMNOZc]").unwrap());

/// C0 controls the scrollback does not interpret (keeps \t \n \r \x08)
static RE_CONTROL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\x00-\x07\x0b\x0c\x0e-\x1f\x7f]").unwrap());

/// Strip terminal escape sequences so output renders as plain text
pub fn strip(text: &str) -> String {
    if !text.contains('\x1b') && !RE_CONTROL.is_match(text) {
        return text.to_string();
    }
    let text = RE_OSC.replace_all(text, "");
    let text = RE_CSI.replace_all(&text, "");
    let text = RE_ESC.replace_all(&text, "");
    RE_CONTROL.replace_all(&text, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_colors() {
        assert_eq!(strip("\x1b[1;32mok\x1b[0m done"), "ok done");
    }

    #[test]
    fn test_strip_title_and_bell() {
        assert_eq!(strip("\x1b]0;admin@box: ~\x07$ "), "$ ");
    }

    #[test]
    fn test_strip_cursor_and_modes() {
        assert_eq!(strip("\x1b[?2004h\x1b[2J\x1b[Hprompt"), "prompt");
        assert_eq!(strip("\x1b(Bplain\x1b="), "plain");
    }

    #[test]
    fn test_plain_text_untouched() {
        assert_eq!(strip("line one\r\nline\ttwo"), "line one\r\nline\ttwo");
    }
}
