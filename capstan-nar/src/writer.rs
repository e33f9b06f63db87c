//! Building NAR byte streams from in-memory trees.

use std::collections::BTreeMap;

/// An in-memory filesystem subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NarEntry {
    Regular {
        executable: bool,
        contents: Vec<u8>,
    },
    Symlink {
        target: String,
    },
    Directory {
        entries: BTreeMap<String, NarEntry>,
    },
}

impl NarEntry {
    pub fn file(contents: impl Into<Vec<u8>>) -> Self {
        Self::Regular {
            executable: false,
            contents: contents.into(),
        }
    }

    pub fn executable(contents: impl Into<Vec<u8>>) -> Self {
        Self::Regular {
            executable: true,
            contents: contents.into(),
        }
    }

    pub fn symlink(target: impl Into<String>) -> Self {
        Self::Symlink {
            target: target.into(),
        }
    }

    pub fn directory(entries: impl IntoIterator<Item = (&'static str, NarEntry)>) -> Self {
        Self::Directory {
            entries: entries
                .into_iter()
                .map(|(name, entry)| (name.to_string(), entry))
                .collect(),
        }
    }

    /// Serialise the tree into NAR bytes.
    pub fn dump(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_token(&mut out, b"nix-archive-1");
        write_node(&mut out, self);
        out
    }
}

fn write_int(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_token(out: &mut Vec<u8>, token: &[u8]) {
    write_int(out, token.len() as u64);
    out.extend_from_slice(token);
    let pad = (token.len().wrapping_neg()) & 7;
    out.extend(std::iter::repeat(0u8).take(pad));
}

fn write_node(out: &mut Vec<u8>, entry: &NarEntry) {
    write_token(out, b"(");
    write_token(out, b"type");
    match entry {
        NarEntry::Regular {
            executable,
            contents,
        } => {
            write_token(out, b"regular");
            if *executable {
                write_token(out, b"executable");
                write_token(out, b"");
            }
            write_token(out, b"contents");
            write_token(out, contents);
        }
        NarEntry::Symlink { target } => {
            write_token(out, b"symlink");
            write_token(out, b"target");
            write_token(out, target.as_bytes());
        }
        NarEntry::Directory { entries } => {
            write_token(out, b"directory");
            for (name, child) in entries {
                write_token(out, b"entry");
                write_token(out, b"(");
                write_token(out, b"name");
                write_token(out, name.as_bytes());
                write_token(out, b"node");
                write_node(out, child);
                write_token(out, b")");
            }
        }
    }
    write_token(out, b")");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_nar_is_minimal() {
        let nar = NarEntry::file("").dump();
        // magic, "(", "type", "regular", "contents", "", ")", each 8-aligned:
        // 24 + 16 + 16 + 16 + 16 + 8 + 16
        assert_eq!(nar.len(), 112);
        assert_eq!(&nar[..8], &13u64.to_le_bytes());
        assert_eq!(&nar[8..21], b"nix-archive-1");
    }

    #[test]
    fn executable_marker_present() {
        let plain = NarEntry::file("x").dump();
        let exec = NarEntry::executable("x").dump();
        // "executable" token (24 bytes) plus its empty argument (8 bytes)
        assert_eq!(exec.len(), plain.len() + 24 + 8);
    }
}
