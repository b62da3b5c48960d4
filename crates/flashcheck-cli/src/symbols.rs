//! Symbol addresses from linker maps and `nm` output

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use flashcheck_can::config::parse_address;
use flashcheck_core::SymbolResolver;

/// Resolves symbols from explicit overrides first, then from a map file
#[derive(Debug, Default)]
pub struct MapFileResolver {
    overrides: HashMap<String, u32>,
    map_text: String,
}

impl MapFileResolver {
    pub fn new(overrides: HashMap<String, u32>, map_text: String) -> Self {
        Self {
            overrides,
            map_text,
        }
    }

    /// Build from a variant's `symbols` table and optional map file
    pub fn load<'a>(
        symbols: impl IntoIterator<Item = (&'a String, &'a String)>,
        map_file: Option<&Path>,
    ) -> Result<Self> {
        let mut overrides = HashMap::new();
        for (name, address) in symbols {
            let address = parse_address(address)
                .with_context(|| format!("Invalid address '{}' for symbol {}", address, name))?;
            overrides.insert(name.clone(), address);
        }

        let map_text = match map_file {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read symbol map: {}", path.display()))?,
            None => String::new(),
        };

        Ok(Self::new(overrides, map_text))
    }
}

impl SymbolResolver for MapFileResolver {
    fn resolve(&self, name: &str) -> Option<u32> {
        if let Some(&address) = self.overrides.get(name) {
            return Some(address);
        }
        self.map_text.lines().find_map(|line| address_on_line(line, name))
    }
}

/// Address on `line` if one of its tokens is exactly `name`
///
/// Handles `nm` output (`50006a34 D StubVersion_Main`) and map-file
/// layouts (`StubVersion_Main 0x50006a34 ...`).
fn address_on_line(line: &str, name: &str) -> Option<u32> {
    let mut tokens = line.split_whitespace();
    if !tokens.clone().any(|t| t == name) {
        return None;
    }
    tokens.find_map(parse_hex_token)
}

fn parse_hex_token(token: &str) -> Option<u32> {
    if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        return u32::from_str_radix(hex, 16).ok();
    }
    if token.len() >= 8 && token.chars().all(|c| c.is_ascii_hexdigit()) {
        // nm pads 32-bit addresses to 8 digits; wider output keeps the low word
        let low = &token[token.len() - 8..];
        return u32::from_str_radix(low, 16).ok();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const NM_OUTPUT: &str = "\
50006a30 B counter
50006a34 D StubVersion_Main
50006a35 D StubVersion_Main_Extra
";

    const MAP_FILE: &str = "\
.data           0x50006000     0x200
 StubVersion_Sub               0x50006a40   0x1   obj/version.o
";

    #[test]
    fn test_nm_output() {
        let resolver = MapFileResolver::new(HashMap::new(), NM_OUTPUT.to_string());
        assert_eq!(resolver.resolve("StubVersion_Main"), Some(0x5000_6A34));
        assert_eq!(resolver.resolve("StubVersion_Main_Extra"), Some(0x5000_6A35));
        assert_eq!(resolver.resolve("StubVersion"), None);
    }

    #[test]
    fn test_map_file_layout() {
        let resolver = MapFileResolver::new(HashMap::new(), MAP_FILE.to_string());
        assert_eq!(resolver.resolve("StubVersion_Sub"), Some(0x5000_6A40));
        assert_eq!(resolver.resolve("missing"), None);
    }

    #[test]
    fn test_overrides_take_precedence() {
        let overrides = HashMap::from([("StubVersion_Main".to_string(), 0x1000)]);
        let resolver = MapFileResolver::new(overrides, NM_OUTPUT.to_string());
        assert_eq!(resolver.resolve("StubVersion_Main"), Some(0x1000));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let map = dir.path().join("app.map");
        std::fs::write(&map, MAP_FILE).unwrap();

        let symbols = std::collections::BTreeMap::from([(
            "StubVersion_Main".to_string(),
            "0x50006a34".to_string(),
        )]);
        let resolver = MapFileResolver::load(&symbols, Some(map.as_path())).unwrap();

        assert_eq!(resolver.resolve("StubVersion_Main"), Some(0x5000_6A34));
        assert_eq!(resolver.resolve("StubVersion_Sub"), Some(0x5000_6A40));
    }

    #[test]
    fn test_wide_nm_address_keeps_low_word() {
        assert_eq!(parse_hex_token("0000000050006a34"), Some(0x5000_6A34));
        assert_eq!(parse_hex_token("D"), None);
        assert_eq!(parse_hex_token("0x1"), Some(1));
    }
}
