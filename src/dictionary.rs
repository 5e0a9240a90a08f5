use std::collections::HashMap;

/// A bidirectional dictionary mapping between strings and integer ids.
///
/// Ids are assigned in first-seen order and never change, which keeps them
/// stable across a model save/load round-trip.
#[derive(Debug, Clone, Default)]
pub struct Dictionary {
    /// Map from string to id
    str_to_id: HashMap<String, u32>,
    /// Map from id to string
    id_to_str: Vec<String>,
}

impl Dictionary {
    /// Create a new empty dictionary
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in the dictionary
    pub fn len(&self) -> usize {
        self.id_to_str.len()
    }

    /// Returns `true` if the dictionary contains no entries
    pub fn is_empty(&self) -> bool {
        self.id_to_str.is_empty()
    }

    /// Get or create an id for a string
    pub fn get_or_insert(&mut self, s: &str) -> u32 {
        if let Some(&id) = self.str_to_id.get(s) {
            id
        } else {
            let id = self.id_to_str.len() as u32;
            self.str_to_id.insert(s.to_string(), id);
            self.id_to_str.push(s.to_string());
            id
        }
    }

    /// Look up the id of a string without inserting
    pub fn get(&self, s: &str) -> Option<u32> {
        self.str_to_id.get(s).copied()
    }

    /// Look up the string for an id
    pub fn get_name(&self, id: u32) -> Option<&str> {
        self.id_to_str.get(id as usize).map(|s| s.as_str())
    }

    /// Iterate over all (string, id) pairs in id order
    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> + '_ {
        self.id_to_str
            .iter()
            .enumerate()
            .map(|(id, s)| (s.as_str(), id as u32))
    }
}
