//! Sysconfig Module
//!
//! Reader and writer for sysconfig-style key-value files, the configuration
//! format the server and client tooling consume. Comments and key order are
//! preserved so a programmatic update does not clobber the operator's notes.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// A single key-value pair in a sysconfig file, together with the comment
/// lines leading up to it.
#[derive(Debug, Clone, Default)]
pub struct SysconfigEntry {
    pub leading_comments: Vec<String>,
    pub key: String,
    pub value: String,
}

/// Key-value pairs of a sysconfig file, convertible back to text in the
/// original key order.
#[derive(Debug, Clone, Default)]
pub struct Sysconfig {
    entries: Vec<SysconfigEntry>,
    index: HashMap<String, usize>,
}

impl Sysconfig {
    /// Read a sysconfig file and parse its content. With `auto_create`, a
    /// missing file is created empty instead of failing.
    pub fn parse_file(path: impl AsRef<Path>, auto_create: bool) -> Result<Sysconfig> {
        let path = path.as_ref();
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound && auto_create => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(path, b"")?;
                String::new()
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read sysconfig file \"{}\"", path.display()))
            }
        };
        Ok(Self::parse(&content))
    }

    /// Parse sysconfig text into memory structures. Lines that are neither
    /// comments nor key-value pairs are kept as comments.
    pub fn parse(input: &str) -> Sysconfig {
        let mut conf = Sysconfig::default();
        let mut leading_comments = Vec::new();
        for line in input.lines() {
            let line = line.trim();
            if let Some(eq) = line.find('=').filter(|_| !line.starts_with('#')) {
                let key = line[..eq].trim().to_string();
                let value = line[eq + 1..].trim().trim_matches('"').to_string();
                conf.index.insert(key.clone(), conf.entries.len());
                conf.entries.push(SysconfigEntry {
                    leading_comments: std::mem::take(&mut leading_comments),
                    key,
                    value,
                });
            } else {
                leading_comments.push(line.to_string());
            }
        }
        conf
    }

    /// Set value for a key, creating the key if it does not yet exist.
    pub fn set(&mut self, key: &str, value: impl ToString) {
        match self.index.get(key) {
            Some(&at) => self.entries[at].value = value.to_string(),
            None => {
                self.index.insert(key.to_string(), self.entries.len());
                self.entries.push(SysconfigEntry {
                    leading_comments: Vec::new(),
                    key: key.to_string(),
                    value: value.to_string(),
                });
            }
        }
    }

    /// Give a space-separated array value to a key.
    pub fn set_str_array(&mut self, key: &str, values: &[String]) {
        self.set(key, values.join(" "));
    }

    /// Return the string value of a key, or the default when the key is
    /// absent or blank.
    pub fn get_string(&self, key: &str, default_value: &str) -> String {
        match self.index.get(key).map(|&at| self.entries[at].value.trim()) {
            Some(value) if !value.is_empty() => value.to_string(),
            _ => default_value.to_string(),
        }
    }

    /// Return the integer value of a key, or the default when the key is
    /// absent or not an integer.
    pub fn get_int<T: std::str::FromStr>(&self, key: &str, default_value: T) -> T {
        self.index
            .get(key)
            .and_then(|&at| self.entries[at].value.trim().parse().ok())
            .unwrap_or(default_value)
    }

    /// Assume the key carries a space-separated array value and return it.
    pub fn get_string_array(&self, key: &str) -> Vec<String> {
        match self.index.get(key) {
            Some(&at) => self.entries[at]
                .value
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Return the boolean value of a key. True values are "yes" or "true".
    pub fn get_bool(&self, key: &str, default_value: bool) -> bool {
        let fallback = if default_value { "yes" } else { "no" };
        matches!(self.get_string(key, fallback).to_lowercase().as_str(), "yes" | "true")
    }

    /// Convert key-value pairs back into text. Values are always surrounded
    /// by double quotes.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            for comment in &entry.leading_comments {
                out.push_str(comment);
                out.push('\n');
            }
            out.push_str(&format!("{}=\"{}\"\n", entry.key, entry.value));
        }
        out
    }
}
