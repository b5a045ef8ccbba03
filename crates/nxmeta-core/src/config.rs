//! Typed access to a JSON configuration document.
//!
//! Every accessor takes an ordered list of key aliases; the first key present in
//! the object wins. Integers may be given as JSON numbers or as hexadecimal
//! strings (with or without a `0x` prefix).

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{Map, Value};

use crate::error::{BuildError, BuildResult};

pub fn read_document(path: &Path) -> Result<Value> {
    let bytes =
        std::fs::read(path).with_context(|| format!("read config: {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parse config JSON: {}", path.display()))
}

/// A JSON object plus the key path it was reached through.
#[derive(Debug, Clone, Copy)]
pub struct Doc<'a> {
    map: &'a Map<String, Value>,
    path: &'a str,
}

/// Owned counterpart of [`Doc`] for nested values whose path is computed.
#[derive(Debug, Clone)]
pub struct Node<'a> {
    pub value: &'a Value,
    pub path: String,
}

impl<'a> Doc<'a> {
    pub fn root(value: &'a Value) -> BuildResult<Self> {
        match value {
            Value::Object(map) => Ok(Doc { map, path: "" }),
            _ => Err(BuildError::WrongType {
                path: "<root>".to_string(),
                expected: "an object",
            }),
        }
    }

    pub fn path(&self) -> &str {
        self.path
    }

    fn key_path(&self, key: &str) -> String {
        join_path(self.path, key)
    }

    fn lookup(&self, keys: &[&'a str]) -> Option<(&'a str, &'a Value)> {
        keys.iter()
            .find_map(|k| self.map.get(*k).map(|v| (*k, v)))
    }

    fn require(&self, keys: &[&'a str]) -> BuildResult<(&'a str, &'a Value)> {
        self.lookup(keys).ok_or_else(|| BuildError::MissingKey {
            path: self.key_path(keys.first().copied().unwrap_or("")),
        })
    }

    pub fn bool(&self, keys: &[&'a str], default: Option<bool>) -> BuildResult<bool> {
        let Some((key, value)) = self.lookup(keys) else {
            return default.ok_or_else(|| BuildError::MissingKey {
                path: self.key_path(keys[0]),
            });
        };
        value.as_bool().ok_or_else(|| BuildError::WrongType {
            path: self.key_path(key),
            expected: "a boolean",
        })
    }

    pub fn int(
        &self,
        keys: &[&'a str],
        min: u64,
        max: u64,
        default: Option<u64>,
    ) -> BuildResult<u64> {
        let Some((key, value)) = self.lookup(keys) else {
            return default.ok_or_else(|| BuildError::MissingKey {
                path: self.key_path(keys[0]),
            });
        };
        int_in_range(value, &self.key_path(key), min, max)
    }

    pub fn u64(&self, keys: &[&'a str], default: Option<u64>) -> BuildResult<u64> {
        self.int(keys, 0, u64::MAX, default)
    }

    pub fn u32(&self, keys: &[&'a str], default: Option<u32>) -> BuildResult<u32> {
        Ok(self.int(keys, 0, u32::MAX as u64, default.map(u64::from))? as u32)
    }

    pub fn u8(&self, keys: &[&'a str], default: Option<u8>) -> BuildResult<u8> {
        Ok(self.int(keys, 0, u8::MAX as u64, default.map(u64::from))? as u8)
    }

    pub fn string(
        &self,
        keys: &[&'a str],
        max_len: Option<usize>,
        default: Option<&str>,
    ) -> BuildResult<String> {
        let (path, s) = match self.lookup(keys) {
            Some((key, value)) => {
                let path = self.key_path(key);
                let s = value.as_str().ok_or_else(|| BuildError::WrongType {
                    path: path.clone(),
                    expected: "a string",
                })?;
                (path, s.to_string())
            }
            None => match default {
                Some(d) => (self.key_path(keys[0]), d.to_string()),
                None => {
                    return Err(BuildError::MissingKey {
                        path: self.key_path(keys[0]),
                    })
                }
            },
        };
        if let Some(max) = max_len {
            if s.len() > max {
                return Err(BuildError::TooLong {
                    path,
                    len: s.len(),
                    max,
                });
            }
        }
        Ok(s)
    }

    /// List items with their element paths. A missing key yields an empty list
    /// when `default_empty` is set.
    pub fn list(&self, keys: &[&'a str], default_empty: bool) -> BuildResult<Vec<Node<'a>>> {
        let Some((key, value)) = self.lookup(keys) else {
            if default_empty {
                return Ok(Vec::new());
            }
            return Err(BuildError::MissingKey {
                path: self.key_path(keys[0]),
            });
        };
        let path = self.key_path(key);
        let items = value.as_array().ok_or_else(|| BuildError::WrongType {
            path: path.clone(),
            expected: "a list",
        })?;
        Ok(items
            .iter()
            .enumerate()
            .map(|(i, value)| Node {
                value,
                path: format!("{path}[{i}]"),
            })
            .collect())
    }

    pub fn node(&self, keys: &[&'a str]) -> BuildResult<Node<'a>> {
        let (key, value) = self.require(keys)?;
        Ok(Node {
            value,
            path: self.key_path(key),
        })
    }
}

impl<'a> Node<'a> {
    /// Views this node as an object. The returned [`Doc`] borrows the node's path.
    pub fn dict(&self) -> BuildResult<Doc<'_>> {
        match self.value {
            Value::Object(map) => Ok(Doc {
                map,
                path: &self.path,
            }),
            _ => Err(BuildError::WrongType {
                path: self.path.clone(),
                expected: "a dict",
            }),
        }
    }

    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }

    pub fn int(&self, min: u64, max: u64) -> BuildResult<u64> {
        int_in_range(self.value, &self.path, min, max)
    }

    pub fn str(&self) -> BuildResult<&'a str> {
        self.value.as_str().ok_or_else(|| BuildError::WrongType {
            path: self.path.clone(),
            expected: "a string",
        })
    }
}

fn join_path(base: &str, key: &str) -> String {
    if base.is_empty() {
        key.to_string()
    } else {
        format!("{base}.{key}")
    }
}

/// Integer value of a JSON number or hexadecimal string.
pub fn parse_int(value: &Value) -> Option<i128> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .map(i128::from)
            .or_else(|| n.as_i64().map(i128::from)),
        Value::String(s) => {
            let s = s.trim();
            let digits = s
                .strip_prefix("0x")
                .or_else(|| s.strip_prefix("0X"))
                .unwrap_or(s);
            if digits.is_empty() {
                return None;
            }
            u64::from_str_radix(digits, 16).ok().map(i128::from)
        }
        _ => None,
    }
}

fn int_in_range(value: &Value, path: &str, min: u64, max: u64) -> BuildResult<u64> {
    let v = parse_int(value).ok_or_else(|| BuildError::WrongType {
        path: path.to_string(),
        expected: "an integer (number or hex string)",
    })?;
    if v < min as i128 || v > max as i128 {
        return Err(BuildError::OutOfRange {
            path: path.to_string(),
            value: v,
            min,
            max,
        });
    }
    Ok(v as u64)
}
