//! The user environment block: an ordered `NAME=VALUE` sequence derived
//! from an access token.
//!
//! The block is read-only after creation; callers that need extra variables
//! get a new block via [`EnvironmentBlock::merged`]. Serialization produces
//! the double-NUL-terminated UTF-16 region that create-process consumes
//! when the unicode-environment creation flag is set.

/// An ordered sequence of environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentBlock {
    entries: Vec<(String, String)>,
}

impl EnvironmentBlock {
    /// Build a block from name/value pairs, preserving order.
    #[must_use]
    pub fn from_entries<I, N, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        }
    }

    /// Parse the OS's double-NUL-terminated wide block.
    ///
    /// Entries without a separating `=` (beyond a possible leading one, as
    /// in the hidden per-drive `=C:=...` variables) are kept with an empty
    /// value so round-trips stay faithful.
    #[must_use]
    pub fn from_wide_block(block: &[u16]) -> Self {
        let mut entries = Vec::new();
        for chunk in block.split(|&w| w == 0) {
            if chunk.is_empty() {
                break;
            }
            let entry = String::from_utf16_lossy(chunk);
            // Split at the first '=' past position 0.
            let split = entry
                .char_indices()
                .skip(1)
                .find(|&(_, c)| c == '=')
                .map(|(i, _)| i);
            match split {
                Some(i) => entries.push((entry[..i].to_string(), entry[i + 1..].to_string())),
                None => entries.push((entry, String::new())),
            }
        }
        Self { entries }
    }

    /// Case-insensitive variable lookup.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// A new block with `overrides` applied: existing names (compared
    /// case-insensitively) are replaced in place, new names appended.
    #[must_use]
    pub fn merged<'a, I>(&self, overrides: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut entries = self.entries.clone();
        for (name, value) in overrides {
            match entries
                .iter_mut()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
            {
                Some((_, v)) => *v = value.to_string(),
                None => entries.push((name.to_string(), value.to_string())),
            }
        }
        Self { entries }
    }

    /// Serialize as the double-NUL-terminated UTF-16 block create-process
    /// expects. An empty block is still two NULs.
    #[must_use]
    pub fn to_wide_block(&self) -> Vec<u16> {
        let mut block = Vec::new();
        for (name, value) in &self.entries {
            block.extend(name.encode_utf16());
            block.push(u16::from(b'='));
            block.extend(value.encode_utf16());
            block.push(0);
        }
        if self.entries.is_empty() {
            block.push(0);
        }
        block.push(0);
        block
    }

    /// The entries in order.
    #[must_use]
    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    /// Number of variables in the block.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the block holds no variables.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
