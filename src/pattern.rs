//! Hole patterns: parsing, matching, formatting, and filesystem expansion.
//!
//! A pattern is a string with zero or more holes:
//!
//! - `{name}` interpolates a value from the ambient bindings.
//! - `{*name}` captures one filename-safe run (no `/`).
//! - `{**name}` captures any run, possibly spanning `/`.
//! - `{*_name}` / `{**_name}` (shorthand `{_name}`) are the non-captured
//!   wildcard counterparts; they match the same but bind nothing, which is
//!   what marks an output pattern as dynamic.
//!
//! `{{` and `}}` escape literal braces.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::{fmt, fs};

use ignore::WalkBuilder;
use itertools::Itertools;
use regex::Regex;

use crate::Result;
use crate::annotation::{Annotated, Annotations};
use crate::error::Error;

pub type Bindings = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HoleKind {
    Interp,
    Capture,
    DeepCapture,
    Wildcard,
    DeepWildcard,
}

impl HoleKind {
    fn is_capturing(self) -> bool {
        matches!(self, HoleKind::Capture | HoleKind::DeepCapture)
    }

    fn is_wildcard(self) -> bool {
        matches!(self, HoleKind::Wildcard | HoleKind::DeepWildcard)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Hole { name: String, kind: HoleKind },
}

#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    parts: Vec<Part>,
    annotations: Annotations,
    compiled: OnceLock<Regex>,
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.annotations == other.annotations
    }
}

impl Eq for Pattern {}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

fn valid_hole_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Pattern {
    pub fn parse(source: impl Into<Annotated>) -> Result<Pattern> {
        let source = source.into();
        let annotations = source.annotations();
        let text = source.value().to_string();
        let invalid = |reason: &str| Error::InvalidPattern {
            pattern: text.clone(),
            reason: reason.to_string(),
        };

        let mut parts: Vec<Part> = vec![];
        let mut literal = String::new();
        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '}' => return Err(invalid("unmatched `}`").into()),
                '{' => {
                    let mut inner = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some('{') => return Err(invalid("nested `{`").into()),
                            Some(c) => inner.push(c),
                            None => return Err(invalid("unterminated hole").into()),
                        }
                    }
                    let (name, kind) = if let Some(rest) = inner.strip_prefix("**") {
                        let kind = if rest.starts_with('_') {
                            HoleKind::DeepWildcard
                        } else {
                            HoleKind::DeepCapture
                        };
                        (rest.to_string(), kind)
                    } else if let Some(rest) = inner.strip_prefix('*') {
                        let kind = if rest.starts_with('_') {
                            HoleKind::Wildcard
                        } else {
                            HoleKind::Capture
                        };
                        (rest.to_string(), kind)
                    } else if inner.starts_with('_') {
                        // `{_name}` is shorthand for `{*_name}`.
                        (inner.clone(), HoleKind::Wildcard)
                    } else {
                        (inner.clone(), HoleKind::Interp)
                    };
                    if !valid_hole_name(&name) {
                        return Err(invalid(&format!("invalid hole name `{name}`")).into());
                    }
                    if !literal.is_empty() {
                        parts.push(Part::Literal(std::mem::take(&mut literal)));
                    }
                    parts.push(Part::Hole { name, kind });
                }
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }

        let captures = parts
            .iter()
            .filter_map(|p| match p {
                Part::Hole { name, kind } if kind.is_capturing() => Some(name.as_str()),
                _ => None,
            })
            .collect_vec();
        if let Some(dup) = captures.iter().duplicates().next() {
            return Err(invalid(&format!("capture `{dup}` appears more than once")).into());
        }

        Ok(Pattern {
            source: text,
            parts,
            annotations,
            compiled: OnceLock::new(),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn annotations(&self) -> Annotations {
        self.annotations
    }

    pub fn is_phony(&self) -> bool {
        self.annotations.phony
    }

    /// Names of the capturing holes, in order of appearance.
    pub fn capture_names(&self) -> Vec<String> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Hole { name, kind } if kind.is_capturing() => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn is_capturing(&self) -> bool {
        self.parts.iter().any(
            |p| matches!(p, Part::Hole { kind, .. } if kind.is_capturing()),
        )
    }

    /// Dynamic patterns contain non-captured wildcards; their concrete output
    /// set is only known from the filesystem.
    pub fn is_dynamic(&self) -> bool {
        self.parts.iter().any(
            |p| matches!(p, Part::Hole { kind, .. } if kind.is_wildcard()),
        )
    }

    /// Literal characters before the first capturing or wildcard hole; used
    /// to rank ambiguous matches.
    pub fn specificity(&self) -> usize {
        let mut n = 0;
        for part in &self.parts {
            match part {
                Part::Literal(s) => n += s.len(),
                Part::Hole { kind, .. } if *kind == HoleKind::Interp => {}
                Part::Hole { .. } => break,
            }
        }
        n
    }

    fn regex_source(&self, env: &Bindings) -> Result<String> {
        let mut re = String::from("^");
        for part in &self.parts {
            match part {
                Part::Literal(s) => re.push_str(&regex::escape(s)),
                Part::Hole { name, kind } => match kind {
                    HoleKind::Interp => {
                        let value = env.get(name).ok_or_else(|| Error::UnboundHole {
                            pattern: self.source.clone(),
                            name: name.clone(),
                        })?;
                        re.push_str(&regex::escape(value));
                    }
                    HoleKind::Capture => re.push_str(&format!("(?P<{name}>[^/]+?)")),
                    HoleKind::DeepCapture => re.push_str(&format!("(?P<{name}>.+?)")),
                    HoleKind::Wildcard => re.push_str("(?:[^/]+?)"),
                    HoleKind::DeepWildcard => re.push_str("(?:.+?)"),
                },
            }
        }
        re.push('$');
        Ok(re)
    }

    fn regex(&self, env: &Bindings) -> Result<Regex> {
        let needs_env = self
            .parts
            .iter()
            .any(|p| matches!(p, Part::Hole { kind, .. } if *kind == HoleKind::Interp));
        if !needs_env {
            if let Some(re) = self.compiled.get() {
                return Ok(re.clone());
            }
        }
        let re = Regex::new(&self.regex_source(env)?).map_err(|e| Error::InvalidPattern {
            pattern: self.source.clone(),
            reason: e.to_string(),
        })?;
        if !needs_env {
            let _ = self.compiled.set(re.clone());
        }
        Ok(re)
    }

    /// Match `path` against the pattern, returning the captured bindings.
    /// Interpolation holes are substituted from `env` before matching.
    pub fn matches(&self, path: &str, env: &Bindings) -> Result<Option<Bindings>> {
        let re = self.regex(env)?;
        let Some(caps) = re.captures(path) else {
            return Ok(None);
        };
        let mut bindings = Bindings::new();
        for name in self.capture_names() {
            if let Some(m) = caps.name(&name) {
                bindings.insert(name, m.as_str().to_string());
            }
        }
        Ok(Some(bindings))
    }

    /// Render the pattern with every hole bound. Formatting a non-captured
    /// wildcard is an error.
    pub fn format(&self, bindings: &Bindings) -> Result<Annotated> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(s) => out.push_str(s),
                Part::Hole { name, kind } => {
                    if kind.is_wildcard() {
                        return Err(Error::FormatWildcard {
                            pattern: self.source.clone(),
                            name: name.clone(),
                        }
                        .into());
                    }
                    let value = bindings.get(name).ok_or_else(|| Error::UnboundHole {
                        pattern: self.source.clone(),
                        name: name.clone(),
                    })?;
                    out.push_str(value);
                }
            }
        }
        Ok(Annotated::with_annotations(out, self.annotations))
    }

    /// Substitute bound interpolation and capture holes, leaving wildcards in
    /// place. The result is either fully literal or still dynamic.
    pub fn interpolate(&self, bindings: &Bindings) -> Result<Pattern> {
        let mut parts: Vec<Part> = vec![];
        let mut source = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(s) => {
                    source.push_str(&s.replace('{', "{{").replace('}', "}}"));
                    match parts.last_mut() {
                        Some(Part::Literal(prev)) => prev.push_str(s),
                        _ => parts.push(Part::Literal(s.clone())),
                    }
                }
                Part::Hole { name, kind } => {
                    if kind.is_wildcard() {
                        let stars = if *kind == HoleKind::DeepWildcard { "**" } else { "*" };
                        source.push_str(&format!("{{{stars}{name}}}"));
                        parts.push(part.clone());
                        continue;
                    }
                    let value = bindings.get(name).ok_or_else(|| Error::UnboundHole {
                        pattern: self.source.clone(),
                        name: name.clone(),
                    })?;
                    source.push_str(&value.replace('{', "{{").replace('}', "}}"));
                    match parts.last_mut() {
                        Some(Part::Literal(prev)) => prev.push_str(value),
                        _ => parts.push(Part::Literal(value.clone())),
                    }
                }
            }
        }
        Ok(Pattern {
            source,
            parts,
            annotations: self.annotations,
            compiled: OnceLock::new(),
        })
    }

    /// The literal path of a pattern without capturing or wildcard holes.
    pub fn literal_path(&self, env: &Bindings) -> Result<Option<Annotated>> {
        if self.is_dynamic() || self.is_capturing() {
            return Ok(None);
        }
        Ok(Some(self.format(env)?))
    }

    fn static_prefix(&self) -> &str {
        match self.parts.first() {
            Some(Part::Literal(s)) => s,
            _ => "",
        }
    }

    /// Expand the pattern against the filesystem under `root`. Results are
    /// `(path, bindings)` pairs ordered by lexicographic path.
    pub fn glob(&self, root: &Path, env: &Bindings) -> Result<Vec<(Annotated, Bindings)>> {
        if let Some(path) = self.literal_path(env)? {
            let on_disk = root.join(path.value());
            if fs::symlink_metadata(&on_disk).is_ok() {
                return Ok(vec![(path, Bindings::new())]);
            }
            return Ok(vec![]);
        }

        let prefix = self.static_prefix();
        let base_dir = match prefix.rfind('/') {
            Some(idx) => root.join(&prefix[..idx]),
            None => root.to_path_buf(),
        };
        if !base_dir.is_dir() {
            return Ok(vec![]);
        }

        let re = self.regex(env)?;
        let mut matches: Vec<(Annotated, Bindings)> = vec![];
        let walker = WalkBuilder::new(&base_dir)
            .hidden(false)
            .ignore(false)
            .parents(false)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .follow_links(false)
            .build();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    debug!("glob {self}: {err}");
                    continue;
                }
            };
            if entry.file_type().is_some_and(|t| t.is_dir()) {
                continue;
            }
            let rel = match entry.path().strip_prefix(root) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            let rel = rel.to_string_lossy().replace('\\', "/");
            if let Some(caps) = re.captures(&rel) {
                let mut bindings = Bindings::new();
                for name in self.capture_names() {
                    if let Some(m) = caps.name(&name) {
                        bindings.insert(name, m.as_str().to_string());
                    }
                }
                matches.push((Annotated::with_annotations(rel, self.annotations), bindings));
            }
        }
        matches.sort_by(|a, b| a.0.value().cmp(b.0.value()));
        Ok(matches)
    }

    /// Glob this pattern and render `template` once per match with the
    /// captured bindings.
    pub fn extract(
        &self,
        root: &Path,
        template: &Pattern,
        env: &Bindings,
    ) -> Result<Vec<Annotated>> {
        self.glob(root, env)?
            .into_iter()
            .map(|(_, mut bindings)| {
                for (k, v) in env {
                    bindings.entry(k.clone()).or_insert_with(|| v.clone());
                }
                template.format(&bindings)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::phony;

    fn bindings(pairs: &[(&str, &str)]) -> Bindings {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn literal_roundtrip() {
        let p = Pattern::parse("foo").unwrap();
        assert!(!p.is_capturing());
        assert!(!p.is_dynamic());
        assert_eq!(p.matches("foo", &Bindings::new()).unwrap(), Some(Bindings::new()));
        assert_eq!(p.matches("bar", &Bindings::new()).unwrap(), None);
    }

    #[test]
    fn capture_roundtrip() {
        let p = Pattern::parse("obj/{*name}.o").unwrap();
        let b = bindings(&[("name", "a")]);
        let formatted = p.format(&b).unwrap();
        assert_eq!(formatted.value(), "obj/a.o");
        assert_eq!(p.matches("obj/a.o", &Bindings::new()).unwrap(), Some(b));
    }

    #[test]
    fn deep_capture_spans_directories() {
        let p = Pattern::parse("src/{**path}.c").unwrap();
        let b = p.matches("src/a/b/c.c", &Bindings::new()).unwrap().unwrap();
        assert_eq!(b["path"], "a/b/c");
    }

    #[test]
    fn single_capture_rejects_separator() {
        let p = Pattern::parse("obj/{*name}.o").unwrap();
        assert_eq!(p.matches("obj/a/b.o", &Bindings::new()).unwrap(), None);
    }

    #[test]
    fn capture_requires_one_character() {
        let p = Pattern::parse("obj/{*name}.o").unwrap();
        assert_eq!(p.matches("obj/.o", &Bindings::new()).unwrap(), None);
    }

    #[test]
    fn wildcard_matches_but_binds_nothing() {
        let p = Pattern::parse("files/{*name}/{**_file}").unwrap();
        assert!(p.is_dynamic());
        assert!(p.is_capturing());
        let b = p
            .matches("files/X/sub/part.txt", &Bindings::new())
            .unwrap()
            .unwrap();
        assert_eq!(b, bindings(&[("name", "X")]));
    }

    #[test]
    fn underscore_shorthand_is_wildcard() {
        let p = Pattern::parse("tmp/{_scratch}").unwrap();
        assert!(p.is_dynamic());
        assert!(!p.is_capturing());
        assert!(p.matches("tmp/x", &Bindings::new()).unwrap().is_some());
        assert!(p.matches("tmp/x/y", &Bindings::new()).unwrap().is_none());
    }

    #[test]
    fn interpolation_substitutes_before_matching() {
        let p = Pattern::parse("{mode}/{*name}.o").unwrap();
        let env = bindings(&[("mode", "debug")]);
        let b = p.matches("debug/a.o", &env).unwrap().unwrap();
        assert_eq!(b, bindings(&[("name", "a")]));
        assert!(p.matches("release/a.o", &env).unwrap().is_none());
    }

    #[test]
    fn format_wildcard_is_an_error() {
        let p = Pattern::parse("files/{*name}/{**_file}").unwrap();
        let err = p.format(&bindings(&[("name", "X")])).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::FormatWildcard { .. })
        ));
    }

    #[test]
    fn format_missing_binding_is_an_error() {
        let p = Pattern::parse("obj/{*name}.o").unwrap();
        let err = p.format(&Bindings::new()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::UnboundHole { .. })
        ));
    }

    #[test]
    fn escaped_braces_are_literal() {
        let p = Pattern::parse("a{{b}}c").unwrap();
        assert!(p.matches("a{b}c", &Bindings::new()).unwrap().is_some());
    }

    #[test]
    fn duplicate_capture_rejected() {
        assert!(Pattern::parse("{*a}/{*a}").is_err());
    }

    #[test]
    fn unterminated_hole_rejected() {
        assert!(Pattern::parse("obj/{*name").is_err());
    }

    #[test]
    fn specificity_counts_literals_before_first_capture() {
        let a = Pattern::parse("files/{*name}/.all.done").unwrap();
        let b = Pattern::parse("files/extra/{*name}").unwrap();
        assert_eq!(a.specificity(), "files/".len());
        assert_eq!(b.specificity(), "files/extra/".len());
        assert!(b.specificity() > a.specificity());
    }

    #[test]
    fn interpolate_keeps_wildcards() {
        let p = Pattern::parse("files/{*name}/{**_file}").unwrap();
        let q = p.interpolate(&bindings(&[("name", "X")])).unwrap();
        assert!(q.is_dynamic());
        assert!(!q.is_capturing());
        assert_eq!(q.source(), "files/X/{**_file}");
    }

    #[test]
    fn annotations_survive_transforms() {
        let p = Pattern::parse(phony("all")).unwrap();
        assert!(p.is_phony());
        assert!(p.format(&Bindings::new()).unwrap().is_phony());
    }

    #[test]
    fn glob_and_extract() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("files/X")).unwrap();
        std::fs::write(root.join("files/X/b.txt"), "").unwrap();
        std::fs::write(root.join("files/X/a.txt"), "").unwrap();
        std::fs::write(root.join("files/X/c.dat"), "").unwrap();

        let p = Pattern::parse("files/X/{*part}.txt").unwrap();
        let matches = p.glob(root, &Bindings::new()).unwrap();
        assert_eq!(
            matches
                .iter()
                .map(|(path, _)| path.value().to_string())
                .collect::<Vec<_>>(),
            vec!["files/X/a.txt", "files/X/b.txt"]
        );
        assert_eq!(matches[0].1, bindings(&[("part", "a")]));

        let template = Pattern::parse("out/{part}.copy").unwrap();
        let extracted = p.extract(root, &template, &Bindings::new()).unwrap();
        assert_eq!(
            extracted.iter().map(|a| a.value().to_string()).collect::<Vec<_>>(),
            vec!["out/a.copy", "out/b.copy"]
        );
    }

    #[test]
    fn glob_literal_checks_existence() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("foo"), "").unwrap();
        let p = Pattern::parse("foo").unwrap();
        assert_eq!(p.glob(root, &Bindings::new()).unwrap().len(), 1);
        let q = Pattern::parse("bar").unwrap();
        assert!(q.glob(root, &Bindings::new()).unwrap().is_empty());
    }

    #[test]
    fn match_of_format_returns_bindings() {
        let p = Pattern::parse("files/{*name}/part.{*ext}").unwrap();
        let b = bindings(&[("name", "deep"), ("ext", "txt")]);
        let path = p.format(&b).unwrap();
        assert_eq!(p.matches(path.value(), &Bindings::new()).unwrap(), Some(b));
    }
}
