use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Code returned for values the encoder has never seen.
pub const UNKNOWN_CODE: u32 = 0;

/// Injective string to code mapping fitted on the distinct training values.
///
/// Codes follow the sorted order of the values and start at 1; 0 is reserved
/// for unknown values, so encoding never fails.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryEncoder {
    column: String,
    classes: Vec<String>,
}

impl CategoryEncoder {
    pub fn fit<I, S>(column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut classes: Vec<String> = values
            .into_iter()
            .map(|v| v.as_ref().trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();
        classes.sort();
        classes.dedup();
        Self {
            column: column.to_string(),
            classes,
        }
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    /// Name of the model feature this encoder produces.
    pub fn code_column(&self) -> String {
        format!("{}_code", self.column)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn encode(&self, value: &str) -> u32 {
        let value = value.trim();
        match self.classes.binary_search_by(|c| c.as_str().cmp(value)) {
            Ok(idx) => idx as u32 + 1,
            Err(_) => UNKNOWN_CODE,
        }
    }

    /// Like `encode`, but a numeric string naming a valid code is taken as
    /// that code.
    pub fn encode_or_code(&self, value: &str) -> u32 {
        match self.encode(value) {
            UNKNOWN_CODE => value
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|code| self.decode(*code).is_some())
                .unwrap_or(UNKNOWN_CODE),
            code => code,
        }
    }

    pub fn decode(&self, code: u32) -> Option<&str> {
        code.checked_sub(1)
            .and_then(|idx| self.classes.get(idx as usize))
            .map(String::as_str)
    }

    pub fn mapping(&self) -> BTreeMap<&str, u32> {
        self.classes
            .iter()
            .enumerate()
            .map(|(idx, class)| (class.as_str(), idx as u32 + 1))
            .collect()
    }
}
