//! Incremental NAR metadata extraction.
//!
//! [`NarExtractor`] is a push parser: callers feed it whatever bytes they
//! have and it reports how many belonged to the archive. Because the NAR
//! grammar is fully length-prefixed, the parser always knows whether the
//! archive is finished, which lets a protocol reader stop at exactly the
//! right byte inside a longer stream.

use thiserror::Error;

use capstan_store_core::{Hash, HashContext, StorePath};

use crate::member::{NarMember, NarMemberMap, NarMemberType};

const NAR_MAGIC: &[u8] = b"nix-archive-1";

/// Grammar tokens are short; anything larger is file contents, which are
/// streamed and never buffered.
const MAX_TOKEN_LEN: u64 = 4096;

#[derive(Error, Debug)]
pub enum NarFormatError {
    #[error("input is not a NAR archive")]
    BadMagic,

    #[error("expected {expected}, got '{found}'")]
    UnexpectedToken {
        expected: &'static str,
        found: String,
    },

    #[error("token of {0} bytes exceeds the token limit")]
    TokenTooLong(u64),

    #[error("invalid member name '{0}'")]
    InvalidName(String),

    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),

    #[error("data past the end of the archive")]
    TrailingData,
}

/// Where we are in the grammar.
#[derive(Debug)]
enum State {
    Magic,
    Open,
    TypeKeyword,
    TypeValue,
    RegularNext { executable: bool },
    ExecutableBlank,
    Contents,
    CloseRegular,
    TargetKeyword,
    TargetValue,
    CloseSymlink,
    DirNext,
    EntryOpen,
    NameKeyword,
    NameValue,
    NodeKeyword,
    EntryClose,
    Done,
}

/// What the lexer is currently assembling.
#[derive(Debug)]
enum Lex {
    Int { buf: [u8; 8], filled: usize },
    Token { len: usize, padded: usize, buf: Vec<u8> },
    FileData { remaining: u64 },
    FilePad { remaining: usize },
}

impl Lex {
    fn int() -> Self {
        Lex::Int {
            buf: [0; 8],
            filled: 0,
        }
    }
}

fn padding(len: u64) -> usize {
    (len.wrapping_neg() & 7) as usize
}

pub struct NarExtractor {
    store_path: StorePath,
    members: NarMemberMap,
    state: State,
    lex: Lex,
    path_stack: Vec<String>,
    file_hash: Option<HashContext>,
    file_size: u64,
    file_executable: bool,
}

impl NarExtractor {
    pub fn new(store_path: StorePath, members: NarMemberMap) -> Self {
        Self {
            store_path,
            members,
            state: State::Magic,
            lex: Lex::int(),
            path_stack: Vec::new(),
            file_hash: None,
            file_size: 0,
            file_executable: false,
        }
    }

    /// Feed bytes into the parser. Returns how many were consumed; fewer
    /// than `data.len()` only when the archive ended inside `data`.
    pub fn push(&mut self, data: &[u8]) -> Result<usize, NarFormatError> {
        let mut consumed = 0;
        while consumed < data.len() && !self.is_complete() {
            consumed += self.step(&data[consumed..])?;
        }
        Ok(consumed)
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, State::Done)
    }

    fn step(&mut self, data: &[u8]) -> Result<usize, NarFormatError> {
        match &mut self.lex {
            Lex::Int { buf, filled } => {
                let n = (8 - *filled).min(data.len());
                buf[*filled..*filled + n].copy_from_slice(&data[..n]);
                *filled += n;
                if *filled == 8 {
                    let len = u64::from_le_bytes(*buf);
                    self.begin_payload(len)?;
                }
                Ok(n)
            }
            Lex::Token { len, padded, buf } => {
                let n = (*padded - buf.len()).min(data.len());
                buf.extend_from_slice(&data[..n]);
                if buf.len() == *padded {
                    let token = buf[..*len].to_vec();
                    self.lex = Lex::int();
                    self.on_token(&token)?;
                }
                Ok(n)
            }
            Lex::FileData { remaining } => {
                let n = (*remaining).min(data.len() as u64) as usize;
                if let Some(hash) = self.file_hash.as_mut() {
                    hash.update(&data[..n]);
                }
                *remaining -= n as u64;
                if *remaining == 0 {
                    self.finish_file();
                }
                Ok(n)
            }
            Lex::FilePad { remaining } => {
                let n = (*remaining).min(data.len());
                *remaining -= n;
                if *remaining == 0 {
                    self.lex = Lex::int();
                }
                Ok(n)
            }
        }
    }

    /// A length prefix just completed; decide what it introduces.
    fn begin_payload(&mut self, len: u64) -> Result<(), NarFormatError> {
        if matches!(self.state, State::Contents) {
            self.file_size = len;
            self.file_hash = Some(HashContext::new());
            if len == 0 {
                self.finish_file();
                self.lex = Lex::int();
            } else {
                self.lex = Lex::FileData { remaining: len };
            }
            return Ok(());
        }
        if len > MAX_TOKEN_LEN {
            return Err(NarFormatError::TokenTooLong(len));
        }
        if len == 0 {
            self.lex = Lex::int();
            self.on_token(&[])
        } else {
            self.lex = Lex::Token {
                len: len as usize,
                padded: len as usize + padding(len),
                buf: Vec::with_capacity(len as usize + padding(len)),
            };
            Ok(())
        }
    }

    fn finish_file(&mut self) {
        let hash = self.file_hash.take().map(HashContext::finish);
        let size = self.file_size;
        let executable = self.file_executable;
        self.record(NarMember {
            member_type: NarMemberType::Regular,
            executable,
            file_size: Some(size),
            sha256: hash,
            symlink_target: None,
        });
        self.file_executable = false;
        let pad = padding(size);
        self.lex = if pad > 0 {
            Lex::FilePad { remaining: pad }
        } else {
            Lex::int()
        };
        self.state = State::CloseRegular;
    }

    fn record(&mut self, member: NarMember) {
        self.members
            .insert(self.store_path.clone(), self.path_stack.join("/"), member);
    }

    fn node_complete(&mut self) {
        self.state = if self.path_stack.is_empty() {
            State::Done
        } else {
            State::EntryClose
        };
    }

    fn on_token(&mut self, token: &[u8]) -> Result<(), NarFormatError> {
        let unexpected = |expected: &'static str| NarFormatError::UnexpectedToken {
            expected,
            found: String::from_utf8_lossy(token).into_owned(),
        };

        match self.state {
            State::Magic => {
                if token != NAR_MAGIC {
                    return Err(NarFormatError::BadMagic);
                }
                self.state = State::Open;
            }
            State::Open => {
                if token != b"(" {
                    return Err(unexpected("'('"));
                }
                self.state = State::TypeKeyword;
            }
            State::TypeKeyword => {
                if token != b"type" {
                    return Err(unexpected("'type'"));
                }
                self.state = State::TypeValue;
            }
            State::TypeValue => match token {
                b"regular" => self.state = State::RegularNext { executable: false },
                b"symlink" => self.state = State::TargetKeyword,
                b"directory" => {
                    self.record(NarMember {
                        member_type: NarMemberType::Directory,
                        executable: false,
                        file_size: None,
                        sha256: None,
                        symlink_target: None,
                    });
                    self.state = State::DirNext;
                }
                _ => return Err(unexpected("a member type")),
            },
            State::RegularNext { executable } => match token {
                b"executable" if !executable => self.state = State::ExecutableBlank,
                b"contents" => {
                    self.file_executable = executable;
                    self.state = State::Contents;
                }
                _ => return Err(unexpected("'contents'")),
            },
            State::ExecutableBlank => {
                if !token.is_empty() {
                    return Err(unexpected("''"));
                }
                self.state = State::RegularNext { executable: true };
            }
            State::Contents => unreachable!("contents are handled by the lexer"),
            State::CloseRegular | State::CloseSymlink => {
                if token != b")" {
                    return Err(unexpected("')'"));
                }
                self.node_complete();
            }
            State::TargetKeyword => {
                if token != b"target" {
                    return Err(unexpected("'target'"));
                }
                self.state = State::TargetValue;
            }
            State::TargetValue => {
                let target = std::str::from_utf8(token)
                    .map_err(|_| NarFormatError::InvalidUtf8("symlink target"))?
                    .to_string();
                self.record(NarMember {
                    member_type: NarMemberType::Symlink,
                    executable: false,
                    file_size: None,
                    sha256: None,
                    symlink_target: Some(target),
                });
                self.state = State::CloseSymlink;
            }
            State::DirNext => match token {
                b"entry" => self.state = State::EntryOpen,
                b")" => self.node_complete(),
                _ => return Err(unexpected("'entry' or ')'")),
            },
            State::EntryOpen => {
                if token != b"(" {
                    return Err(unexpected("'('"));
                }
                self.state = State::NameKeyword;
            }
            State::NameKeyword => {
                if token != b"name" {
                    return Err(unexpected("'name'"));
                }
                self.state = State::NameValue;
            }
            State::NameValue => {
                let name = std::str::from_utf8(token)
                    .map_err(|_| NarFormatError::InvalidUtf8("member name"))?;
                if name.is_empty() || name == "." || name == ".." || name.contains('/') {
                    return Err(NarFormatError::InvalidName(name.to_string()));
                }
                self.path_stack.push(name.to_string());
                self.state = State::NodeKeyword;
            }
            State::NodeKeyword => {
                if token != b"node" {
                    return Err(unexpected("'node'"));
                }
                self.state = State::Open;
            }
            State::EntryClose => {
                if token != b")" {
                    return Err(unexpected("')'"));
                }
                self.path_stack.pop();
                self.state = State::DirNext;
            }
            State::Done => return Err(NarFormatError::TrailingData),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::NarEntry;

    fn extract(entry: &NarEntry) -> (NarMemberMap, Vec<u8>) {
        let nar = entry.dump();
        let members = NarMemberMap::new();
        let mut extractor =
            NarExtractor::new(StorePath::new("/nix/store/aaaa-test"), members.clone());
        let consumed = extractor.push(&nar).unwrap();
        assert_eq!(consumed, nar.len());
        assert!(extractor.is_complete());
        (members, nar)
    }

    fn member(members: &NarMemberMap, path: &str) -> NarMember {
        members
            .get(&StorePath::new("/nix/store/aaaa-test"), path)
            .unwrap_or_else(|| panic!("no member at '{path}'"))
    }

    #[test]
    fn single_file() {
        let (members, _) = extract(&NarEntry::file("hello"));
        let m = member(&members, "");
        assert_eq!(m.member_type, NarMemberType::Regular);
        assert_eq!(m.file_size, Some(5));
        assert_eq!(m.sha256, Some(Hash::digest("hello")));
        assert!(!m.executable);
    }

    #[test]
    fn executable_file() {
        let (members, _) = extract(&NarEntry::executable("#!/bin/sh\n"));
        assert!(member(&members, "").executable);
    }

    #[test]
    fn empty_file() {
        let (members, _) = extract(&NarEntry::file(""));
        let m = member(&members, "");
        assert_eq!(m.file_size, Some(0));
        assert_eq!(m.sha256, Some(Hash::digest("")));
    }

    #[test]
    fn nested_tree() {
        let tree = NarEntry::directory([
            (
                "bin",
                NarEntry::directory([("app", NarEntry::executable("binary"))]),
            ),
            ("readme", NarEntry::file("docs")),
            ("link", NarEntry::symlink("bin/app")),
        ]);
        let (members, _) = extract(&tree);

        assert_eq!(member(&members, "").member_type, NarMemberType::Directory);
        assert_eq!(
            member(&members, "bin").member_type,
            NarMemberType::Directory
        );
        assert_eq!(member(&members, "bin/app").file_size, Some(6));
        assert_eq!(member(&members, "readme").sha256, Some(Hash::digest("docs")));
        assert_eq!(
            member(&members, "link").symlink_target.as_deref(),
            Some("bin/app")
        );
        assert_eq!(members.len(), 5);
    }

    #[test]
    fn byte_at_a_time() {
        let nar = NarEntry::directory([("f", NarEntry::file("abc"))]).dump();
        let members = NarMemberMap::new();
        let mut extractor =
            NarExtractor::new(StorePath::new("/nix/store/aaaa-test"), members.clone());
        for byte in &nar {
            assert!(!extractor.is_complete());
            assert_eq!(extractor.push(std::slice::from_ref(byte)).unwrap(), 1);
        }
        assert!(extractor.is_complete());
        assert_eq!(members.len(), 2);
    }

    #[test]
    fn stops_at_archive_end() {
        let mut nar = NarEntry::file("x").dump();
        let len = nar.len();
        nar.extend_from_slice(b"garbage after the archive");

        let mut extractor =
            NarExtractor::new(StorePath::new("/nix/store/aaaa-test"), NarMemberMap::new());
        let consumed = extractor.push(&nar).unwrap();
        assert_eq!(consumed, len);
        assert!(extractor.is_complete());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut nar = NarEntry::file("x").dump();
        nar[8] = b'X';
        let mut extractor =
            NarExtractor::new(StorePath::new("/nix/store/aaaa-test"), NarMemberMap::new());
        assert!(matches!(
            extractor.push(&nar),
            Err(NarFormatError::BadMagic)
        ));
    }

    #[test]
    fn rejects_traversal_names() {
        let nar = NarEntry::directory([("f", NarEntry::file("x"))]).dump();
        // Corrupt the entry name "f" into "." (same length).
        let needle = b"name";
        let at = nar
            .windows(needle.len())
            .position(|w| w == needle)
            .unwrap();
        let mut bad = nar.clone();
        bad[at + 16] = b'.';

        let mut extractor =
            NarExtractor::new(StorePath::new("/nix/store/aaaa-test"), NarMemberMap::new());
        assert!(matches!(
            extractor.push(&bad),
            Err(NarFormatError::InvalidName(_))
        ));
    }
}
