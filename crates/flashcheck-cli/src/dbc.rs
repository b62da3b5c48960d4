//! Expectations from DBC message databases
//!
//! Only the parts needed for cycle-time checks are read:
//! - `BO_ <id> <name>: <dlc> <sender>` message definitions
//! - `BA_DEF_DEF_ "GenMsgCycleTime" <ms>;` the default cycle time
//! - `BA_ "GenMsgCycleTime" BO_ <id> <ms>;` per-message cycle times
//!
//! Everything else in the file is ignored.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use flashcheck_core::{ChannelId, CollaboratorError, ExpectationLoader, RawExpectation};
use tracing::{debug, warn};

const CYCLE_TIME_ATTR: &str = "\"GenMsgCycleTime\"";

/// Bit 31 of a DBC message id flags an extended (29-bit) identifier
const EXTENDED_FLAG: u32 = 0x8000_0000;

/// Loads expectations from one DBC file per channel
pub struct DbcLoader {
    sources: Vec<(ChannelId, PathBuf)>,
}

impl DbcLoader {
    pub fn new(sources: Vec<(ChannelId, PathBuf)>) -> Self {
        Self { sources }
    }
}

impl ExpectationLoader for DbcLoader {
    fn load_expectations(&self) -> Result<Vec<RawExpectation>, CollaboratorError> {
        let mut all = Vec::new();
        for (channel, path) in &self.sources {
            let content = std::fs::read_to_string(path).map_err(|source| CollaboratorError::Io {
                path: path.display().to_string(),
                source,
            })?;
            let loaded = parse_dbc(&content, path, *channel)?;
            debug!(
                %channel,
                path = %path.display(),
                messages = loaded.len(),
                "Message database loaded"
            );
            all.extend(loaded);
        }
        Ok(all)
    }
}

/// Parse DBC text into raw expectations for `channel`
///
/// Messages keep their file order. A message without its own cycle time
/// gets the default, or 0 (aperiodic) when the file declares none.
pub fn parse_dbc(
    content: &str,
    path: &Path,
    channel: ChannelId,
) -> Result<Vec<RawExpectation>, CollaboratorError> {
    let parse_err = |line: usize, message: String| CollaboratorError::Parse {
        path: path.display().to_string(),
        line,
        message,
    };

    let mut messages: Vec<u32> = Vec::new();
    let mut cycle_times: HashMap<u32, u32> = HashMap::new();
    let mut default_cycle = 0u32;

    for (idx, line) in content.lines().enumerate() {
        let line_no = idx + 1;
        let tokens: Vec<&str> = line
            .trim()
            .trim_end_matches(';')
            .split_whitespace()
            .collect();

        match tokens.as_slice() {
            ["BO_", id, ..] => {
                let id = id
                    .parse::<u32>()
                    .map_err(|_| parse_err(line_no, format!("invalid message id '{}'", id)))?;
                messages.push(id);
            }
            ["BA_DEF_DEF_", attr, value, ..] if *attr == CYCLE_TIME_ATTR => {
                default_cycle = value
                    .parse()
                    .map_err(|_| parse_err(line_no, format!("invalid cycle time '{}'", value)))?;
            }
            ["BA_", attr, "BO_", id, value, ..] if *attr == CYCLE_TIME_ATTR => {
                let id = id
                    .parse::<u32>()
                    .map_err(|_| parse_err(line_no, format!("invalid message id '{}'", id)))?;
                let cycle = value
                    .parse()
                    .map_err(|_| parse_err(line_no, format!("invalid cycle time '{}'", value)))?;
                cycle_times.insert(id, cycle);
            }
            _ => {}
        }
    }

    let mut expectations = Vec::with_capacity(messages.len());
    for id in messages {
        if id & EXTENDED_FLAG != 0 {
            warn!(
                %channel,
                id = format!("0x{:X}", id & !EXTENDED_FLAG),
                "Skipping extended-id message"
            );
            continue;
        }
        expectations.push(RawExpectation {
            channel,
            identifier: id,
            cycle_ms: cycle_times.get(&id).copied().unwrap_or(default_cycle),
        });
    }

    Ok(expectations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const POWERTRAIN: &str = r#"
VERSION ""

BU_: ECU TESTER

BO_ 291 EngineStatus: 8 ECU
 SG_ EngineSpeed : 0|16@1+ (0.25,0) [0|16383.75] "rpm" TESTER

BO_ 1110 Diagnostics: 8 ECU

BO_ 2566834709 ExtendedMsg: 8 ECU

BO_ 512 Heartbeat: 1 ECU

BA_DEF_ BO_ "GenMsgCycleTime" INT 0 10000;
BA_DEF_DEF_ "GenMsgCycleTime" 100;
BA_ "GenMsgCycleTime" BO_ 291 50;
BA_ "GenMsgCycleTime" BO_ 1110 0;
"#;

    fn ch(n: u8) -> ChannelId {
        ChannelId::new(n).unwrap()
    }

    #[test]
    fn test_parse_cycle_times() {
        let raw = parse_dbc(POWERTRAIN, Path::new("powertrain.dbc"), ch(1)).unwrap();

        let tuples: Vec<(u32, u32)> = raw.iter().map(|r| (r.identifier, r.cycle_ms)).collect();
        assert_eq!(tuples, vec![(0x123, 50), (0x456, 0), (0x200, 100)]);
        assert!(raw.iter().all(|r| r.channel == ch(1)));
    }

    #[test]
    fn test_no_default_means_aperiodic() {
        let content = "BO_ 256 Foo: 8 ECU\n";
        let raw = parse_dbc(content, Path::new("x.dbc"), ch(2)).unwrap();
        assert_eq!(raw[0].cycle_ms, 0);
    }

    #[test]
    fn test_bad_id_reports_line() {
        let content = "VERSION \"\"\nBO_ abc Foo: 8 ECU\n";
        let err = parse_dbc(content, Path::new("bad.dbc"), ch(1)).unwrap_err();
        assert!(matches!(err, CollaboratorError::Parse { line: 2, .. }));
    }

    #[test]
    fn test_loader_reads_each_channel() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.dbc");
        let b = dir.path().join("b.dbc");
        std::fs::write(&a, "BO_ 291 A: 8 ECU\nBA_DEF_DEF_ \"GenMsgCycleTime\" 20;\n").unwrap();
        std::fs::write(&b, "BO_ 291 B: 8 ECU\nBA_ \"GenMsgCycleTime\" BO_ 291 10;\n").unwrap();

        let loader = DbcLoader::new(vec![(ch(1), a), (ch(2), b)]);
        let raw = loader.load_expectations().unwrap();

        assert_eq!(raw.len(), 2);
        assert_eq!((raw[0].channel, raw[0].cycle_ms), (ch(1), 20));
        assert_eq!((raw[1].channel, raw[1].cycle_ms), (ch(2), 10));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let loader = DbcLoader::new(vec![(ch(1), PathBuf::from("/nonexistent/x.dbc"))]);
        assert!(matches!(
            loader.load_expectations(),
            Err(CollaboratorError::Io { .. })
        ));
    }
}
