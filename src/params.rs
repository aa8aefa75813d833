//! Key=value token parser for option strings (spec §4.A). Two flavors
//! share one implementation, distinguished only by the set of
//! characters considered a separator between tokens: a space-like
//! parser for kernel command lines (`root=... rootflags=...`), and a
//! comma(+space) parser for the inner contents of `rootflags=...`.
//!
//! Values never contain the parser's own separators; no escaping is
//! defined or needed (spec §4.A).

use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Separator {
    /// One or more ASCII whitespace characters.
    Space,
    /// A comma, optionally followed by whitespace.
    CommaSpace,
}

impl Separator {
    fn is_boundary(self, c: char) -> bool {
        match self {
            Separator::Space => c.is_whitespace(),
            Separator::CommaSpace => c == ',' || c.is_whitespace(),
        }
    }

}

/// A parser over one option string flavor. Stateless; the separator is
/// the only configuration.
#[derive(Clone, Copy, Debug)]
pub struct ParamParser {
    sep: Separator,
}

impl ParamParser {
    pub const fn space() -> Self {
        Self { sep: Separator::Space }
    }

    pub const fn comma() -> Self {
        Self { sep: Separator::CommaSpace }
    }

    /// Split `text` into non-empty tokens using the parser's separator set.
    fn tokens(self, text: &str) -> Vec<&str> {
        text.split(|c: char| self.sep.is_boundary(c))
            .filter(|s| !s.is_empty())
            .collect()
    }

    fn token_key(token: &str) -> &str {
        token.split_once('=').map(|(k, _)| k).unwrap_or(token)
    }

    /// The first value for `key`, or `""` if absent. A bare flag (no
    /// `=`) whose name matches `key` yields `""` as well.
    pub fn extract(self, text: &str, key: &str) -> String {
        for tok in self.tokens(text) {
            if Self::token_key(tok) == key {
                return tok.split_once('=').map(|(_, v)| v).unwrap_or("").to_string();
            }
        }
        String::new()
    }

    pub fn has(self, text: &str, key: &str) -> bool {
        self.tokens(text).into_iter().any(|t| Self::token_key(t) == key)
    }

    /// Every occurrence of `key`, in order, values only.
    pub fn extract_multiple(self, text: &str, key: &str) -> Vec<String> {
        self.tokens(text)
            .into_iter()
            .filter(|t| Self::token_key(t) == key)
            .map(|t| t.split_once('=').map(|(_, v)| v).unwrap_or("").to_string())
            .collect()
    }

    /// All key/value pairs as an ordered map (last write wins, matching
    /// a straightforward single pass; bare flags map to `""`).
    pub fn extract_all(self, text: &str) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for tok in self.tokens(text) {
            let key = Self::token_key(tok).to_string();
            let value = tok.split_once('=').map(|(_, v)| v).unwrap_or("").to_string();
            out.insert(key, value);
        }
        out
    }

    /// Replace the first occurrence of `key=...` with `key=value`; if
    /// absent, append using the parser's canonical separator.
    pub fn update(self, text: &str, key: &str, value: &str) -> String {
        let new_token = format!("{key}={value}");
        let mut found = false;
        let mut out_tokens: Vec<String> = Vec::new();
        for tok in self.tokens(text) {
            if !found && Self::token_key(tok) == key {
                out_tokens.push(new_token.clone());
                found = true;
            } else {
                out_tokens.push(tok.to_string());
            }
        }
        if !found {
            out_tokens.push(new_token);
        }
        Self::join(self.sep, &out_tokens)
    }

    /// Remove the first occurrence of `key`.
    pub fn remove(self, text: &str, key: &str) -> String {
        let mut removed = false;
        let out_tokens: Vec<String> = self
            .tokens(text)
            .into_iter()
            .filter(|t| {
                if !removed && Self::token_key(t) == key {
                    removed = true;
                    false
                } else {
                    true
                }
            })
            .map(str::to_string)
            .collect();
        Self::join(self.sep, &out_tokens)
    }

    /// Remove every occurrence of `key`, collapsing whitespace runs.
    pub fn remove_all(self, text: &str, key: &str) -> String {
        let out_tokens: Vec<String> = self
            .tokens(text)
            .into_iter()
            .filter(|t| Self::token_key(t) != key)
            .map(str::to_string)
            .collect();
        Self::join(self.sep, &out_tokens)
    }

    fn join(sep: Separator, tokens: &[String]) -> String {
        let joiner = match sep {
            Separator::Space => " ",
            Separator::CommaSpace => ",",
        };
        tokens.join(joiner)
    }
}

/// The "boot options parser": composes the space parser (for the outer
/// kernel command line) with the comma parser (for `rootflags=`'s
/// inner `subvol=`/`subvolid=`).
#[derive(Clone, Copy, Debug, Default)]
pub struct BootOptionsParser;

impl BootOptionsParser {
    const OUTER: ParamParser = ParamParser::space();
    const INNER: ParamParser = ParamParser::comma();

    pub fn extract_rootflags_field(text: &str, field: &str) -> String {
        let rootflags = Self::OUTER.extract(text, "rootflags");
        Self::INNER.extract(&rootflags, field)
    }

    /// Update `rootflags`'s inner `field=value`, leaving the rest of
    /// `text` untouched.
    pub fn update_rootflags_field(text: &str, field: &str, value: &str) -> String {
        let rootflags = Self::OUTER.extract(text, "rootflags");
        let new_rootflags = Self::INNER.update(&rootflags, field, value);
        Self::OUTER.update(text, "rootflags", &new_rootflags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_and_has() {
        let p = ParamParser::space();
        let text = "root=/dev/sda1 rootflags=subvol=@ quiet";
        assert_eq!(p.extract(text, "root"), "/dev/sda1");
        assert!(p.has(text, "quiet"));
        assert_eq!(p.extract(text, "missing"), "");
    }

    #[test]
    fn update_replaces_first_occurrence_only() {
        let p = ParamParser::space();
        let text = "a=1 b=2 a=3";
        assert_eq!(p.update(text, "a", "9"), "a=9 b=2 a=3");
    }

    #[test]
    fn update_appends_when_absent() {
        let p = ParamParser::space();
        assert_eq!(p.update("quiet", "root", "/dev/sda1"), "quiet root=/dev/sda1");
    }

    #[test]
    fn extract_multiple_preserves_order() {
        let p = ParamParser::space();
        let text = "initrd=/a initrd=/b initrd=/c";
        assert_eq!(
            p.extract_multiple(text, "initrd"),
            vec!["/a".to_string(), "/b".to_string(), "/c".to_string()]
        );
    }

    #[test]
    fn remove_all_collapses_whitespace() {
        let p = ParamParser::space();
        let text = "a=1 b=2 a=3 c=4";
        assert_eq!(p.remove_all(text, "a"), "b=2 c=4");
    }

    #[test]
    fn comma_parser_splits_rootflags() {
        let p = ParamParser::comma();
        let text = "subvol=@,subvolid=256,ssd";
        assert_eq!(p.extract(text, "subvol"), "@");
        assert_eq!(p.extract(text, "subvolid"), "256");
        assert!(p.has(text, "ssd"));
    }

    #[test]
    fn boot_options_parser_round_trips_nested_subvol() {
        let text = "root=/dev/sda1 rootflags=subvol=@/.snapshots/5/snapshot,subvolid=260 quiet";
        assert_eq!(
            BootOptionsParser::extract_rootflags_field(text, "subvol"),
            "@/.snapshots/5/snapshot"
        );
        let updated = BootOptionsParser::update_rootflags_field(text, "subvolid", "999");
        assert_eq!(
            updated,
            "root=/dev/sda1 rootflags=subvol=@/.snapshots/5/snapshot,subvolid=999 quiet"
        );
    }
}
