// src/config/lexicon.rs
//! Versioned ticker lexicon: reserved words, company-name aliases, bot commands.
//!
//! Loaded once at process start and passed around as `Arc<Lexicon>`; nothing
//! reads it from ambient global state. The default lexicon is embedded from
//! `config/lexicon.toml`; `LEXICON_PATH` swaps in a replacement file.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::Context;
use regex::Regex;
use serde::Deserialize;

pub const ENV_LEXICON_PATH: &str = "LEXICON_PATH";

const EMBEDDED_LEXICON: &str = include_str!("../../config/lexicon.toml");

#[derive(Debug, Clone, Deserialize)]
struct LexiconFile {
    version: String,
    #[serde(default)]
    bot_command_prefixes: Vec<String>,
    #[serde(default)]
    bot_commands: Vec<String>,
    #[serde(default)]
    reserved_words: Vec<String>,
    #[serde(default)]
    aliases: BTreeMap<String, String>,
}

#[derive(Debug)]
pub struct Lexicon {
    version: String,
    reserved: HashSet<String>,
    /// lowercase company name -> uppercase ticker
    aliases: HashMap<String, String>,
    alias_re: Option<Regex>,
    bot_prefixes: Vec<String>,
    /// lowercase command words
    bot_commands: HashSet<String>,
}

impl Lexicon {
    pub fn from_toml_str(toml_str: &str) -> anyhow::Result<Self> {
        let file: LexiconFile = toml::from_str(toml_str).context("parsing lexicon TOML")?;

        let reserved = file
            .reserved_words
            .iter()
            .map(|w| w.trim().to_ascii_uppercase())
            .filter(|w| !w.is_empty())
            .collect::<HashSet<_>>();

        let aliases = file
            .aliases
            .iter()
            .map(|(name, ticker)| {
                (
                    name.trim().to_lowercase(),
                    ticker.trim().to_ascii_uppercase(),
                )
            })
            .filter(|(name, ticker)| !name.is_empty() && !ticker.is_empty())
            .collect::<HashMap<_, _>>();

        // Longest names first so "berkshire hathaway" wins over "berkshire".
        let mut names: Vec<&String> = aliases.keys().collect();
        names.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        let alias_re = if names.is_empty() {
            None
        } else {
            let alternation = names
                .iter()
                .map(|n| regex::escape(n))
                .collect::<Vec<_>>()
                .join("|");
            let re = Regex::new(&format!(r"(?i)\b(?:{alternation})\b"))
                .context("compiling alias regex")?;
            Some(re)
        };

        let bot_prefixes = file
            .bot_command_prefixes
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();

        let bot_commands = file
            .bot_commands
            .iter()
            .map(|c| c.trim().to_ascii_lowercase())
            .filter(|c| !c.is_empty())
            .collect();

        Ok(Self {
            version: file.version,
            reserved,
            aliases,
            alias_re,
            bot_prefixes,
            bot_commands,
        })
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading lexicon from {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// The lexicon compiled into the binary.
    pub fn embedded() -> anyhow::Result<Self> {
        Self::from_toml_str(EMBEDDED_LEXICON)
    }

    /// `$LEXICON_PATH` if set, otherwise the embedded lexicon.
    pub fn load() -> anyhow::Result<Self> {
        match std::env::var(ENV_LEXICON_PATH) {
            Ok(p) if !p.trim().is_empty() => Self::from_path(Path::new(p.trim())),
            _ => Self::embedded(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Exact (case-insensitive) match against the reserved-word list.
    pub fn is_reserved(&self, token: &str) -> bool {
        let t = token.trim().trim_start_matches('$');
        self.reserved.contains(&t.to_ascii_uppercase())
    }

    /// Company name -> ticker.
    pub fn resolve_alias(&self, name: &str) -> Option<&str> {
        self.aliases
            .get(&name.trim().to_lowercase())
            .map(|s| s.as_str())
    }

    pub(crate) fn alias_regex(&self) -> Option<&Regex> {
        self.alias_re.as_ref()
    }

    pub fn bot_prefixes(&self) -> &[String] {
        &self.bot_prefixes
    }

    /// Case-insensitive membership in the command allow-list.
    pub fn is_bot_command_word(&self, word: &str) -> bool {
        self.bot_commands.contains(&word.to_ascii_lowercase())
    }

    pub fn reserved_len(&self) -> usize {
        self.reserved.len()
    }

    pub fn alias_len(&self) -> usize {
        self.aliases.len()
    }
}
