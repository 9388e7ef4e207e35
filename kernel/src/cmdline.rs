//! Kernel command line: `key=value` pairs and bare flags separated by
//! whitespace, parsed once before any initializer runs.

use core::fmt;

use heapless::{String, Vec};

/// Most distinct options kept from one command line; the rest are ignored.
pub const MAX_OPTIONS: usize = 32;

/// Capacity of the buffers values are copied into.
pub const VALUE_CAPACITY: usize = 64;

/// A value copied out of the command line.
pub type Value = String<VALUE_CAPACITY>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmdlineError {
    /// The key does not appear on the command line.
    Missing,
    /// The value did not fit the caller's buffer; the prefix that fit was copied.
    Truncated,
}

impl fmt::Display for CmdlineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => f.write_str("not specified"),
            Self::Truncated => f.write_str("value truncated"),
        }
    }
}

/// Read-only view of the parsed command line.
#[derive(Clone, Debug)]
pub struct CommandLine<'a> {
    raw: &'a str,
    options: Vec<(&'a str, &'a str), MAX_OPTIONS>,
    dropped: usize,
}

impl<'a> CommandLine<'a> {
    pub const fn empty() -> Self {
        Self {
            raw: "",
            options: Vec::new(),
            dropped: 0,
        }
    }

    /// Splits `raw` into options. A later occurrence of a key overrides an
    /// earlier one; a bare word is a key with an empty value.
    pub fn parse(raw: &'a str) -> Self {
        let mut cmdline = Self {
            raw: raw.trim(),
            options: Vec::new(),
            dropped: 0,
        };

        for word in raw.split_ascii_whitespace() {
            let (key, value) = word.split_once('=').unwrap_or((word, ""));
            if key.is_empty() {
                continue;
            }
            if let Some(slot) = cmdline.options.iter_mut().find(|(k, _)| *k == key) {
                slot.1 = value;
            } else if cmdline.options.push((key, value)).is_err() {
                cmdline.dropped += 1;
            }
        }

        cmdline
    }

    /// The command line as handed over by the loader.
    pub fn raw(&self) -> &'a str {
        self.raw
    }

    /// Options that did not fit and were ignored.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn get(&self, key: &str) -> Option<&'a str> {
        self.options
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, value)| *value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Copies the value of `key` into `out`, replacing its contents.
    ///
    /// On [`CmdlineError::Truncated`] `out` holds the longest prefix that fits
    /// on a character boundary.
    pub fn value_into<const N: usize>(
        &self,
        key: &str,
        out: &mut String<N>,
    ) -> Result<(), CmdlineError> {
        let value = self.get(key).ok_or(CmdlineError::Missing)?;
        out.clear();
        for ch in value.chars() {
            if out.push(ch).is_err() {
                return Err(CmdlineError::Truncated);
            }
        }
        Ok(())
    }

    /// Copies the value of `key` into a fresh [`Value`].
    pub fn value(&self, key: &str) -> Result<Value, CmdlineError> {
        let mut value = Value::new();
        self.value_into(key, &mut value).map(|()| value)
    }

    /// Returns whether a feature toggle is on. An absent key counts as on;
    /// any value other than `enabled` turns it off.
    pub fn enabled(&self, key: &str) -> bool {
        self.get(key).map_or(true, |value| value == "enabled")
    }
}

impl<'a> Default for CommandLine<'a> {
    fn default() -> Self {
        Self::empty()
    }
}
