use std::path::Path;

/// An INI document with ordered sections and ordered keys.
///
/// This is intentionally small: fdbmonitor configuration files are flat
/// `key = value` lines grouped under `[section]` headers, with `#` or `;`
/// full-line comments. Later duplicate keys win, and a section that appears
/// twice is merged into its first occurrence.
#[derive(Debug, Clone, Default)]
pub struct IniDocument {
    sections: Vec<IniSection>,
}

#[derive(Debug, Clone)]
pub struct IniSection {
    name: String,
    keys: Vec<(String, String)>,
}

impl IniSection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.keys
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(|(k, _)| k.as_str())
    }

    fn set(&mut self, key: String, value: String) {
        if let Some(slot) = self.keys.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.keys.push((key, value));
        }
    }
}

impl IniDocument {
    pub fn load(path: &Path) -> std::io::Result<IniDocument> {
        let raw = std::fs::read_to_string(path)?;
        Ok(Self::parse(&raw))
    }

    pub fn parse(raw: &str) -> IniDocument {
        let mut doc = IniDocument::default();
        let mut current: Option<usize> = None;

        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                current = Some(doc.ensure_section(name.trim()));
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                // Not a header and not an assignment; ignore the line rather
                // than failing the whole file.
                continue;
            };
            if let Some(idx) = current {
                doc.sections[idx].set(key.trim().to_string(), value.trim().to_string());
            }
        }

        doc
    }

    fn ensure_section(&mut self, name: &str) -> usize {
        if let Some(idx) = self.sections.iter().position(|s| s.name == name) {
            return idx;
        }
        self.sections.push(IniSection {
            name: name.to_string(),
            keys: Vec::new(),
        });
        self.sections.len() - 1
    }

    pub fn section(&self, name: &str) -> Option<&IniSection> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.section(name).is_some()
    }

    pub fn sections(&self) -> impl Iterator<Item = &IniSection> {
        self.sections.iter()
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section).and_then(|s| s.get(key))
    }

    /// Look `key` up in each of `sections` in order, returning the first hit.
    ///
    /// This is the fallback chain used for meta-keys: instance section first,
    /// then class, then `[general]`, optionally `[fdbmonitor]`.
    pub fn value_multi(&self, key: &str, sections: &[&str]) -> Option<&str> {
        sections.iter().find_map(|s| self.get(s, key))
    }
}
