//! Mount flags and option-string parsing.
//!
//! Mount system calls carry a `(flags, data)` pair where `data` is a comma-
//! or whitespace-separated option string. Recognized tokens edit the flag
//! word; everything else lands in an argument multimap for the file system
//! driver to interpret.

use std::collections::BTreeMap;

use bitflags::bitflags;

bitflags! {
    /// Linux `MS_*` mount flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MountFlags: u32 {
        const RDONLY = libc::MS_RDONLY as u32;
        const NOSUID = libc::MS_NOSUID as u32;
        const NODEV = libc::MS_NODEV as u32;
        const NOEXEC = libc::MS_NOEXEC as u32;
        const SYNCHRONOUS = libc::MS_SYNCHRONOUS as u32;
        const REMOUNT = libc::MS_REMOUNT as u32;
        const MANDLOCK = libc::MS_MANDLOCK as u32;
        const DIRSYNC = libc::MS_DIRSYNC as u32;
        const NOATIME = libc::MS_NOATIME as u32;
        const NODIRATIME = libc::MS_NODIRATIME as u32;
        const SILENT = libc::MS_SILENT as u32;
        const RELATIME = libc::MS_RELATIME as u32;
        const KERNMOUNT = libc::MS_KERNMOUNT as u32;
        const I_VERSION = libc::MS_I_VERSION as u32;
        const STRICTATIME = libc::MS_STRICTATIME as u32;
        const LAZYTIME = libc::MS_LAZYTIME as u32;

        /// The flags that belong to an individual mount point; the rest of
        /// the word describes the file system instance itself.
        const PERMOUNT_MASK = Self::RDONLY.bits()
            | Self::NOSUID.bits()
            | Self::NODEV.bits()
            | Self::NOEXEC.bits()
            | Self::SYNCHRONOUS.bits()
            | Self::MANDLOCK.bits()
            | Self::DIRSYNC.bits()
            | Self::NOATIME.bits()
            | Self::NODIRATIME.bits()
            | Self::RELATIME.bits()
            | Self::SILENT.bits()
            | Self::STRICTATIME.bits()
            | Self::LAZYTIME.bits();
    }
}

/// Driver-specific options that did not map to a mount flag.
///
/// A multimap keyed by option name; repeated keys keep every value in
/// insertion order.
#[derive(Debug, Clone, Default)]
pub struct MountArguments {
    entries: BTreeMap<String, Vec<String>>,
}

impl MountArguments {
    /// Whether at least one value exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// The first value recorded for `key`.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Every value recorded for `key`, oldest first.
    pub fn values(&self, key: &str) -> &[String] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, key: String, value: String) {
        self.entries.entry(key).or_default().push(value);
    }
}

/// Parsed mount options: the effective flag word plus leftover arguments.
#[derive(Debug, Clone)]
pub struct MountOptions {
    flags: MountFlags,
    arguments: MountArguments,
}

impl MountOptions {
    /// Parses an option string against an initial flag word. `data` is the
    /// raw byte blob from the mount call.
    pub fn parse(flags: MountFlags, data: &[u8]) -> MountOptions {
        let mut options = MountOptions {
            flags,
            arguments: MountArguments::default(),
        };

        let text = String::from_utf8_lossy(data);
        let mut rest = text.as_ref();
        while let Some((token, remainder)) = next_token(rest) {
            options.apply_token(&token);
            rest = remainder;
        }

        options
    }

    pub fn flags(&self) -> MountFlags {
        self.flags
    }

    pub fn arguments(&self) -> &MountArguments {
        &self.arguments
    }

    fn apply_token(&mut self, token: &Token) {
        if token.text.is_empty() {
            return;
        }

        if let Some(split) = token.equals {
            let key = token.text[..split].trim().to_string();
            let value = token.text[split + 1..].trim().to_string();
            self.arguments.insert(key, value);
            return;
        }

        let flags = &mut self.flags;
        match token.text.as_str() {
            "ro" => flags.insert(MountFlags::RDONLY),
            "rw" => flags.remove(MountFlags::RDONLY),
            "suid" => flags.remove(MountFlags::NOSUID),
            "nosuid" => flags.insert(MountFlags::NOSUID),
            "dev" => flags.remove(MountFlags::NODEV),
            "nodev" => flags.insert(MountFlags::NODEV),
            "exec" => flags.remove(MountFlags::NOEXEC),
            "noexec" => flags.insert(MountFlags::NOEXEC),
            "async" => flags.remove(MountFlags::SYNCHRONOUS),
            "sync" => flags.insert(MountFlags::SYNCHRONOUS),
            "remount" => flags.insert(MountFlags::REMOUNT),
            "mand" => flags.insert(MountFlags::MANDLOCK),
            "nomand" => flags.remove(MountFlags::MANDLOCK),
            "dirsync" => flags.insert(MountFlags::DIRSYNC),
            "atime" => flags.remove(MountFlags::NOATIME),
            "noatime" => flags.insert(MountFlags::NOATIME),
            "diratime" => flags.remove(MountFlags::NODIRATIME),
            "nodiratime" => flags.insert(MountFlags::NODIRATIME),
            "relatime" => flags.insert(MountFlags::RELATIME),
            "norelatime" => flags.remove(MountFlags::RELATIME),
            "silent" => flags.insert(MountFlags::SILENT),
            "loud" => flags.remove(MountFlags::SILENT),
            "strictatime" => flags.insert(MountFlags::STRICTATIME),
            "lazytime" => flags.insert(MountFlags::LAZYTIME),
            "nolazytime" => flags.remove(MountFlags::LAZYTIME),
            "iversion" => flags.insert(MountFlags::I_VERSION),
            "noiversion" => flags.remove(MountFlags::I_VERSION),
            _ => {
                self.arguments
                    .insert(token.text.trim().to_string(), String::new());
            }
        }
    }
}

struct Token {
    text: String,
    /// Byte index of the first `=` that appeared outside double quotes.
    equals: Option<usize>,
}

/// Pulls the next token off the option string. Double-quoted spans keep
/// their separators and `=` characters; the quotes themselves are dropped.
fn next_token(input: &str) -> Option<(Token, &str)> {
    let mut chars = input.char_indices().peekable();

    // Skip leading separators.
    while let Some(&(_, ch)) = chars.peek() {
        if ch == ',' || ch.is_whitespace() {
            chars.next();
        } else {
            break;
        }
    }
    chars.peek()?;

    let mut text = String::new();
    let mut equals = None;
    let mut in_quotes = false;
    let mut remainder = "";

    for (index, ch) in chars {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                remainder = &input[index + 1..];
                break;
            }
            ch if ch.is_whitespace() && !in_quotes => {
                remainder = &input[index + ch.len_utf8()..];
                break;
            }
            '=' if !in_quotes => {
                if equals.is_none() {
                    equals = Some(text.len());
                }
                text.push('=');
            }
            ch => text.push(ch),
        }
    }

    Some((
        Token {
            text: text.trim().to_string(),
            equals,
        },
        remainder,
    ))
}
