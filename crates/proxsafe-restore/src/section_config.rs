//! Proxmox section-config files
//!
//! ```text
//! dir: local
//! 	path /var/lib/vz
//! 	content iso,backup
//!
//! nfs: archive
//! 	server 10.0.0.2
//! ```
//!
//! A section starts with an unindented `type: id` header; indented lines are
//! `key value` properties (a bare key is a flag). Blank lines end a section
//! and top-level `#` lines are comments.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub kind: String,
    pub id: String,
    pub props: Vec<(String, String)>,
}

impl Section {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            props: Vec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.props
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.props.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => self.props.push((key.to_string(), value)),
        }
    }

    /// Flag properties count as true; otherwise `1`/`yes`/`true`.
    pub fn flag(&self, key: &str) -> bool {
        match self.get(key) {
            Some("") => true,
            Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "yes" | "true" | "on"),
            None => false,
        }
    }

    /// Properties as `--key value` CLI arguments, skipping `exclude`.
    pub fn to_cli_args(&self, exclude: &[&str]) -> Vec<String> {
        let mut args = Vec::new();
        for (key, value) in &self.props {
            if exclude.contains(&key.as_str()) {
                continue;
            }
            args.push(format!("--{}", key));
            args.push(if value.is_empty() { "1".to_string() } else { value.clone() });
        }
        args
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}: {}", self.kind, self.id)?;
        for (key, value) in &self.props {
            if value.is_empty() {
                writeln!(f, "\t{}", key)?;
            } else {
                writeln!(f, "\t{} {}", key, value)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SectionConfig {
    pub sections: Vec<Section>,
}

impl SectionConfig {
    pub fn parse(text: &str) -> Self {
        let mut sections = Vec::new();
        let mut current: Option<Section> = None;

        for line in text.lines() {
            let indented = line.starts_with(|c: char| c == ' ' || c == '\t');
            let trimmed = line.trim();

            if trimmed.is_empty() {
                sections.extend(current.take());
                continue;
            }
            if !indented && trimmed.starts_with('#') {
                continue;
            }

            if indented {
                if let Some(section) = current.as_mut() {
                    let (key, value) = match trimmed.split_once(char::is_whitespace) {
                        Some((k, v)) => (k, v.trim()),
                        None => (trimmed, ""),
                    };
                    section.props.push((key.to_string(), value.to_string()));
                }
                continue;
            }

            if let Some((kind, id)) = trimmed.split_once(':') {
                sections.extend(current.take());
                current = Some(Section::new(kind.trim(), id.trim()));
            }
        }
        sections.extend(current);
        Self { sections }
    }

    pub fn get(&self, kind: &str, id: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.kind == kind && s.id == id)
    }

    pub fn find(&self, id: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.id == id)
    }

    pub fn of_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Section> + 'a {
        self.sections.iter().filter(move |s| s.kind == kind)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.sections.iter().map(|s| s.id.as_str()).collect()
    }

    /// Replace a section with the same kind and id, or append it.
    pub fn upsert(&mut self, section: Section) {
        match self
            .sections
            .iter_mut()
            .find(|s| s.kind == section.kind && s.id == section.id)
        {
            Some(existing) => *existing = section,
            None => self.sections.push(section),
        }
    }

    pub fn remove(&mut self, kind: &str, id: &str) -> Option<Section> {
        let pos = self
            .sections
            .iter()
            .position(|s| s.kind == kind && s.id == id)?;
        Some(self.sections.remove(pos))
    }
}

impl fmt::Display for SectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, section) in self.sections.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", section)?;
        }
        Ok(())
    }
}
