//! `$(name)` placeholder substitution for argument templates.
//!
//! A template is scanned left to right: text up to `$(` is copied verbatim,
//! the name runs to the next `)`, and is replaced by its binding. There is no
//! escaping and no nesting; a `)` outside a placeholder is ordinary text.

use std::collections::BTreeMap;

use crate::error::ConfigError;

/// Conduit name to path bindings of one process.
pub type Bindings = BTreeMap<String, String>;

const OPEN: &str = "$(";
const CLOSE: char = ')';

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Placeholder(String),
}

/// Parsed argument template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(template: &str) -> Result<Self, ConfigError> {
        let mut segments = Vec::new();
        let mut rest = template;

        while let Some(start) = rest.find(OPEN) {
            if start > 0 {
                segments.push(Segment::Text(rest[..start].to_string()));
            }
            let after = &rest[start + OPEN.len()..];
            let end = after
                .find(CLOSE)
                .ok_or_else(|| ConfigError::MalformedTemplate {
                    template: template.to_string(),
                })?;
            segments.push(Segment::Placeholder(after[..end].to_string()));
            rest = &after[end + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }

        Ok(Self { segments })
    }

    /// Names referenced by the template, in order of appearance.
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Placeholder(name) => Some(name.as_str()),
            Segment::Text(_) => None,
        })
    }

    pub fn render(&self, bindings: &Bindings) -> Result<String, ConfigError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Placeholder(name) => {
                    let value =
                        bindings
                            .get(name)
                            .ok_or_else(|| ConfigError::UnresolvedPlaceholder {
                                name: name.clone(),
                            })?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

/// Parse and render `template` in one step.
pub fn substitute(template: &str, bindings: &Bindings) -> Result<String, ConfigError> {
    Template::parse(template)?.render(bindings)
}
