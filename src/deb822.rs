//! Minimal deb822 stanza parser shared by the Release, Packages and Sources
//! readers.
//!
//! Per the design notes, dynamic stanza→attribute-map parsing (as the original
//! tool did) is replaced with a typed parser: this module only produces
//! case-preserving key→value maps per stanza; the strongly-named records
//! (`ReleaseDoc`, `PackageEntry`, `SourceEntry`) are built from those maps by
//! their respective callers, discarding fields they don't recognise.

use std::collections::BTreeMap;

/// One deb822 stanza: an ordered map from field name to (possibly
/// multi-line) value, with continuation lines folded in.
#[derive(Debug, Default, Clone)]
pub struct Stanza {
    fields: BTreeMap<String, String>,
}

impl Stanza {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Splits `content` into stanzas separated by one or more blank lines, folding
/// `key: value` lines together with their indented continuation lines.
pub fn parse_stanzas(content: &str) -> Vec<Stanza> {
    let mut stanzas = Vec::new();
    let mut current = Stanza::default();
    let mut current_key: Option<String> = None;

    for line in content.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                stanzas.push(std::mem::take(&mut current));
            }
            current_key = None;
            continue;
        }

        if let Some(rest) = line.strip_prefix(' ').or_else(|| line.strip_prefix('\t')) {
            if let Some(key) = &current_key {
                if let Some(value) = current.fields.get_mut(key) {
                    value.push('\n');
                    value.push_str(rest);
                    continue;
                }
            }
            // continuation line with no preceding key: ignore, matches §4.6's
            // "unknown fields are discarded" stance on malformed input.
            continue;
        }

        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim().to_string();
            let value = value.trim().to_string();
            current.fields.insert(key.clone(), value);
            current_key = Some(key);
        }
    }

    if !current.is_empty() {
        stanzas.push(current);
    }

    stanzas
}

/// Parses an indented `<hex-digest> <size> <relative-filename>` checksum block,
/// as used both by Release hash sections and by Sources `Files`/`Checksums-*`
/// fields. Lines that don't parse into exactly three whitespace-separated
/// tokens are skipped.
pub fn parse_checksum_block(block: &str) -> Vec<(String, u64, String)> {
    let mut out = Vec::new();
    for line in block.lines() {
        let mut parts = line.split_whitespace();
        let (Some(hex), Some(size), Some(name)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        if let Ok(size) = size.parse::<u64>() {
            out.push((hex.to_string(), size, name.to_string()));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_continuation_lines() {
        let stanzas = parse_stanzas("Package: hello\nDescription: a\n greeting\n program\n");
        assert_eq!(stanzas.len(), 1);
        assert_eq!(
            stanzas[0].get("Description"),
            Some("a\ngreeting\nprogram")
        );
    }

    #[test]
    fn splits_on_blank_lines() {
        let stanzas = parse_stanzas("Package: a\nSize: 1\n\nPackage: b\nSize: 2\n");
        assert_eq!(stanzas.len(), 2);
        assert_eq!(stanzas[0].get("Package"), Some("a"));
        assert_eq!(stanzas[1].get("Package"), Some("b"));
    }

    #[test]
    fn parses_checksum_block() {
        let block = " abc123 1234 main/binary-amd64/Packages.gz\n deadbeef 4321 main/binary-amd64/Packages\n";
        let parsed = parse_checksum_block(block);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0], ("abc123".to_string(), 1234, "main/binary-amd64/Packages.gz".to_string()));
    }
}
