//! Resolve which raw files make up a structured fileset, and where each one sits.
use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;

use crate::model::{FileReference, Position, StructuredFileset};

/// Width to which t, c and z indices are zero-padded in staged names and patterns.
const INDEX_WIDTH: usize = 4;

/// A compiled file naming template such as `"T{t:d}_C{c:d}.tif"`.
///
/// Literal text must match exactly. `{t}`, `{c}` and `{z}` capture non-negative integers;
/// any other `{name}` or anonymous `{}` field captures a non-empty run of characters.
/// `{{` and `}}` are literal braces.
#[derive(Debug, Clone)]
pub struct NamingPattern {
    template: String,
    regex: Regex,
}

impl NamingPattern {
    pub fn new(template: &str) -> crate::Result<Self> {
        let invalid = |reason: &str| crate::Error::InvalidPattern {
            pattern: template.to_string(),
            reason: reason.to_string(),
        };

        let mut expr = String::from("^");
        let mut literal = String::new();
        let mut seen = BTreeSet::new();
        let mut chars = template.chars().peekable();

        while let Some(ch) = chars.next() {
            match ch {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '}' => return Err(invalid("unmatched '}'")),
                '{' => {
                    let mut field = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some('{') | None => return Err(invalid("unterminated field")),
                            Some(c) => field.push(c),
                        }
                    }
                    expr.push_str(&regex::escape(&literal));
                    literal.clear();

                    let (name, spec) = field.split_once(':').unwrap_or((field.as_str(), ""));
                    let numeric = is_integer_spec(spec);
                    if name.is_empty() {
                        expr.push_str(if numeric { r"(?:\d+)" } else { "(?:.+?)" });
                        continue;
                    }
                    if !is_identifier(name) {
                        return Err(invalid(&format!("invalid field name {name:?}")));
                    }
                    if !seen.insert(name.to_string()) {
                        return Err(invalid(&format!("field {name:?} appears more than once")));
                    }
                    let body = if numeric || matches!(name, "t" | "c" | "z") {
                        r"\d+"
                    } else {
                        ".+?"
                    };
                    expr.push_str(&format!("(?P<{name}>{body})"));
                }
                c => literal.push(c),
            }
        }
        expr.push_str(&regex::escape(&literal));
        expr.push('$');

        let regex = Regex::new(&expr).map_err(|e| invalid(&e.to_string()))?;
        Ok(Self {
            template: template.to_string(),
            regex,
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Match a whole file name, returning its position.
    ///
    /// Axes absent from the template default to 0.
    pub fn position(&self, name: &str) -> Option<Position> {
        let captures = self.regex.captures(name)?;
        let axis = |key: &str| -> Option<u32> {
            match captures.name(key) {
                Some(m) => m.as_str().parse().ok(),
                None => Some(0),
            }
        };
        Some(Position::new(axis("t")?, axis("c")?, axis("z")?))
    }
}

fn is_integer_spec(spec: &str) -> bool {
    spec.strip_suffix('d')
        .is_some_and(|width| width.chars().all(|c| c.is_ascii_digit()))
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A structured fileset together with the file references it selected.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedFileset {
    pub fileset: StructuredFileset,
    /// Matched references, in input order.
    pub selected: Vec<FileReference>,
}

impl ResolvedFileset {
    pub fn file_ids(&self) -> Vec<&str> {
        self.selected.iter().map(|f| f.id.as_str()).collect()
    }

    pub fn total_size(&self) -> u64 {
        self.selected.iter().map(|f| f.size_in_bytes).sum()
    }
}

/// Select the file references whose names match `pattern` and position them.
///
/// Fails with [`crate::Error::HeterogeneousExtension`] unless the selected files share
/// exactly one extension (so an empty selection also fails), and with
/// [`crate::Error::DuplicatePosition`] if two files land on the same position.
pub fn resolve_fileset<'a>(
    file_references: impl IntoIterator<Item = &'a FileReference>,
    pattern: &NamingPattern,
) -> crate::Result<ResolvedFileset> {
    let mut position_map = BTreeMap::new();
    let mut occupied: BTreeMap<Position, &str> = BTreeMap::new();
    let mut selected = Vec::new();
    for fileref in file_references {
        let Some(position) = pattern.position(&fileref.name) else {
            continue;
        };
        if let Some(first) = occupied.insert(position, &fileref.id) {
            return Err(crate::Error::DuplicatePosition {
                first: first.to_string(),
                second: fileref.id.clone(),
                position,
            });
        }
        position_map.insert(fileref.id.clone(), position);
        selected.push(fileref.clone());
    }
    log::debug!(
        "pattern {:?} selected {} file references",
        pattern.template(),
        selected.len()
    );

    let extensions: BTreeSet<String> = selected.iter().map(FileReference::extension).collect();
    if extensions.len() != 1 {
        return Err(crate::Error::HeterogeneousExtension {
            extensions: extensions.into_iter().collect(),
        });
    }
    let extension = extensions.into_iter().next().unwrap_or_default();

    Ok(ResolvedFileset {
        fileset: StructuredFileset {
            position_map,
            extension,
        },
        selected,
    })
}

/// Bioformats range pattern covering every position, e.g.
/// `T<0001-0002>_C<0001-0002>_Z<0000-0000>.tif`.
///
/// The range is the bounding box of the observed positions; gaps inside it are not filled.
pub fn canonical_pattern(
    position_map: &BTreeMap<String, Position>,
    extension: &str,
) -> crate::Result<String> {
    let positions: Vec<&Position> = position_map.values().collect();
    let bounds = |axis: fn(&Position) -> u32| {
        let min = positions.iter().map(|p| axis(p)).min();
        let max = positions.iter().map(|p| axis(p)).max();
        min.zip(max)
    };
    let (Some(t), Some(c), Some(z)) = (bounds(|p| p.t), bounds(|p| p.c), bounds(|p| p.z)) else {
        return Err(crate::Error::general(
            "cannot derive a pattern from an empty fileset",
        ));
    };

    let expected = [t, c, z]
        .iter()
        .map(|(lo, hi)| u64::from(hi - lo) + 1)
        .product::<u64>();
    let observed = positions.iter().collect::<BTreeSet<_>>().len() as u64;
    if observed != expected {
        log::warn!(
            "fileset covers {observed} of {expected} positions in its bounding box; \
             the converter will see gaps"
        );
    }

    let w = INDEX_WIDTH;
    Ok(format!(
        "T<{:0w$}-{:0w$}>_C<{:0w$}-{:0w$}>_Z<{:0w$}-{:0w$}>{extension}",
        t.0, t.1, c.0, c.1, z.0, z.1
    ))
}

impl StructuredFileset {
    pub fn canonical_pattern(&self) -> crate::Result<String> {
        canonical_pattern(&self.position_map, &self.extension)
    }
}

impl Position {
    /// Name under which the file at this position is staged for conversion,
    /// matching [`canonical_pattern`].
    pub fn staged_file_name(&self, extension: &str) -> String {
        let w = INDEX_WIDTH;
        format!(
            "T{:0w$}_C{:0w$}_Z{:0w$}{extension}",
            self.t, self.c, self.z
        )
    }
}
