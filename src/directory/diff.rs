//! Ed-style consensus diffs (dir-spec §4.2).
//!
//! A diff names its base by the SHA3-256 of the base's *signed prefix*
//! and its result by the SHA3-256 of the whole new document:
//!
//! ```text
//! network-status-diff-version 1
//! hash <from-digest> <to-digest>
//! <ed commands>
//! ```
//!
//! Commands are `Xd` / `X,Yd` (delete), `Xc` / `X,Yc` (change, block
//! terminated by a lone `.`), and `Xa` (append after line X, block
//! terminated by `.`). They are applied in the order given; generators
//! emit them so that sequential application against the mutating
//! document is correct.

use sha3::{Digest, Sha3_256};

use crate::error::{Result, TorError};

/// Does this response body look like a diff rather than a full document?
pub fn looks_like_diff(content_type: Option<&str>, body: &str) -> bool {
    if let Some(ct) = content_type {
        if ct.to_ascii_lowercase().contains("diff") {
            return true;
        }
    }
    body.starts_with("network-status-diff-version")
}

#[derive(Debug, Clone)]
enum DiffCommand {
    Delete { start: usize, end: usize },
    Change { start: usize, end: usize, lines: Vec<String> },
    Append { after: usize, lines: Vec<String> },
}

/// A parsed consensus diff.
#[derive(Debug, Clone)]
pub struct ConsensusDiff {
    /// Hex SHA3-256 of the base document's signed prefix.
    pub from_hex: String,
    /// Hex SHA3-256 of the full document the diff produces.
    pub to_hex: String,
    commands: Vec<DiffCommand>,
}

impl ConsensusDiff {
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines();
        match lines.next() {
            Some("network-status-diff-version 1") => {}
            other => {
                return Err(TorError::Directory(format!(
                    "not a v1 consensus diff: {other:?}"
                )))
            }
        }
        let (from_hex, to_hex) = match lines.next().and_then(|l| l.strip_prefix("hash ")) {
            Some(rest) => {
                let mut parts = rest.split_whitespace();
                match (parts.next(), parts.next()) {
                    (Some(from), Some(to)) => (from.to_lowercase(), to.to_lowercase()),
                    _ => return Err(TorError::Directory("diff hash line too short".into())),
                }
            }
            None => return Err(TorError::Directory("diff missing hash line".into())),
        };

        let mut commands = Vec::new();
        while let Some(line) = lines.next() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let (range, op) = line.split_at(line.len() - 1);
            let (start, end) = parse_range(range)?;
            match op {
                "d" => commands.push(DiffCommand::Delete { start, end }),
                "c" => commands.push(DiffCommand::Change {
                    start,
                    end,
                    lines: take_block(&mut lines)?,
                }),
                "a" => commands.push(DiffCommand::Append {
                    after: start,
                    lines: take_block(&mut lines)?,
                }),
                _ => {
                    return Err(TorError::Directory(format!(
                        "unknown diff command: {line}"
                    )))
                }
            }
        }

        Ok(Self {
            from_hex,
            to_hex,
            commands,
        })
    }

    /// Hex digest a base document must have (over its signed prefix) for
    /// this diff to apply.
    pub fn applies_to(&self, base_preimage_hash_hex: &str) -> bool {
        self.from_hex.eq_ignore_ascii_case(base_preimage_hash_hex)
    }

    /// Apply to the full base text, verifying the result digest.
    ///
    /// The caller is expected to have matched `from_hex` against the
    /// base already; a wrong base surfaces as `DiffHashMismatch` here at
    /// the latest.
    pub fn apply(&self, base: &str) -> Result<String> {
        let had_trailing_newline = base.ends_with('\n');
        let mut doc: Vec<String> = base.lines().map(String::from).collect();

        for command in &self.commands {
            match command {
                DiffCommand::Delete { start, end } => {
                    check_range(&doc, *start, *end)?;
                    doc.drain(start - 1..*end);
                }
                DiffCommand::Change { start, end, lines } => {
                    check_range(&doc, *start, *end)?;
                    doc.splice(start - 1..*end, lines.iter().cloned());
                }
                DiffCommand::Append { after, lines } => {
                    if *after > doc.len() {
                        return Err(TorError::Directory(format!(
                            "diff appends after line {after} of {}",
                            doc.len()
                        )));
                    }
                    doc.splice(*after..*after, lines.iter().cloned());
                }
            }
        }

        let mut out = doc.join("\n");
        if had_trailing_newline {
            out.push('\n');
        }

        let digest = hex::encode(Sha3_256::digest(out.as_bytes()));
        if !digest.eq_ignore_ascii_case(&self.to_hex) {
            return Err(TorError::DiffHashMismatch);
        }
        Ok(out)
    }
}

fn parse_range(range: &str) -> Result<(usize, usize)> {
    let bad = || TorError::Directory(format!("bad diff range: {range}"));
    match range.split_once(',') {
        Some((a, b)) => {
            let start = a.parse().map_err(|_| bad())?;
            let end = b.parse().map_err(|_| bad())?;
            if start == 0 || end < start {
                return Err(bad());
            }
            Ok((start, end))
        }
        None => {
            let n: usize = range.parse().map_err(|_| bad())?;
            Ok((n, n))
        }
    }
}

fn check_range(doc: &[String], start: usize, end: usize) -> Result<()> {
    if start == 0 || end > doc.len() {
        return Err(TorError::Directory(format!(
            "diff range {start},{end} outside document of {} lines",
            doc.len()
        )));
    }
    Ok(())
}

/// Collect block lines up to the `.` terminator.
fn take_block<'a>(lines: &mut impl Iterator<Item = &'a str>) -> Result<Vec<String>> {
    let mut block = Vec::new();
    for line in lines {
        if line == "." {
            return Ok(block);
        }
        block.push(line.to_string());
    }
    Err(TorError::Directory("diff block missing terminator".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha3_hex(s: &str) -> String {
        hex::encode(Sha3_256::digest(s.as_bytes()))
    }

    const BASE: &str = "a\nb\nc\nd\ne\nf\ndirectory-signature ";

    fn spec_example_diff() -> (String, String) {
        // 2,3c replaces lines b,c with B,C; 5a appends F2 after original
        // line 5 (e).
        let expected = "a\nB\nC\nd\ne\nF2\nf\ndirectory-signature ";
        let diff = format!(
            "network-status-diff-version 1\nhash {} {}\n2,3c\nB\nC\n.\n5a\nF2\n.\n",
            sha3_hex(BASE),
            sha3_hex(expected),
        );
        (diff, expected.to_string())
    }

    #[test]
    fn applies_spec_example() {
        let (diff_text, expected) = spec_example_diff();
        let diff = ConsensusDiff::parse(&diff_text).unwrap();
        assert!(diff.applies_to(&sha3_hex(BASE)));

        let result = diff.apply(BASE).unwrap();
        assert_eq!(result, expected);
        assert_eq!(sha3_hex(&result), diff.to_hex);
    }

    #[test]
    fn second_application_has_wrong_base() {
        let (diff_text, _) = spec_example_diff();
        let diff = ConsensusDiff::parse(&diff_text).unwrap();
        let once = diff.apply(BASE).unwrap();

        // The result's prefix hash is not the diff's from hash any more.
        assert!(!diff.applies_to(&sha3_hex(&once)));
        // Forcing it anyway trips the result-digest check.
        assert!(matches!(diff.apply(&once), Err(TorError::DiffHashMismatch)));
    }

    #[test]
    fn delete_command() {
        let base = "one\ntwo\nthree\nfour\n";
        let expected = "one\nfour\n";
        let diff_text = format!(
            "network-status-diff-version 1\nhash {} {}\n2,3d\n",
            sha3_hex(base),
            sha3_hex(expected)
        );
        let diff = ConsensusDiff::parse(&diff_text).unwrap();
        assert_eq!(diff.apply(base).unwrap(), expected);
    }

    #[test]
    fn append_at_start() {
        let base = "x\ny\n";
        let expected = "new\nx\ny\n";
        let diff_text = format!(
            "network-status-diff-version 1\nhash {} {}\n0a\nnew\n.\n",
            sha3_hex(base),
            sha3_hex(expected)
        );
        let diff = ConsensusDiff::parse(&diff_text).unwrap();
        assert_eq!(diff.apply(base).unwrap(), expected);
    }

    #[test]
    fn bad_result_hash_is_rejected() {
        let base = "x\ny\n";
        let diff_text = format!(
            "network-status-diff-version 1\nhash {} {}\n1d\n",
            sha3_hex(base),
            "00".repeat(32)
        );
        let diff = ConsensusDiff::parse(&diff_text).unwrap();
        assert!(matches!(diff.apply(base), Err(TorError::DiffHashMismatch)));
    }

    #[test]
    fn out_of_range_command_is_rejected() {
        let base = "x\ny\n";
        let diff_text = format!(
            "network-status-diff-version 1\nhash {} {}\n9d\n",
            sha3_hex(base),
            sha3_hex(base)
        );
        let diff = ConsensusDiff::parse(&diff_text).unwrap();
        assert!(diff.apply(base).is_err());
    }

    #[test]
    fn detection_by_header_and_content_type() {
        assert!(looks_like_diff(None, "network-status-diff-version 1\n..."));
        assert!(looks_like_diff(Some("application/x-consensus-diff"), ""));
        assert!(!looks_like_diff(Some("text/plain"), "network-status-version 3"));
    }

    #[test]
    fn malformed_headers_rejected() {
        assert!(ConsensusDiff::parse("").is_err());
        assert!(ConsensusDiff::parse("network-status-diff-version 2\nhash a b\n").is_err());
        assert!(ConsensusDiff::parse("network-status-diff-version 1\nnope\n").is_err());
        assert!(
            ConsensusDiff::parse("network-status-diff-version 1\nhash aa bb\n3x\n").is_err()
        );
        assert!(ConsensusDiff::parse(
            "network-status-diff-version 1\nhash aa bb\n2a\nunterminated\n"
        )
        .is_err());
    }
}
