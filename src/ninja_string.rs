//! Strings containing `$var` and `${pkg.var}` references.
//!
//! A [`NinjaString`] is parsed once against a variable lookup and stores
//! its references by variable identity rather than by name. Rendering
//! substitutes names qualified through a package-alias view, applying the
//! escaping appropriate for the position the string is written into.

use smol_str::SmolStr;

use crate::ninja_defs::VariableId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NinjaStringError {
    #[error("invalid character after '$' at byte offset {0}")]
    InvalidCharAfterDollar(usize),

    #[error("unexpected end of string after '$'")]
    EofAfterDollar,

    #[error("unexpected end of string in variable name")]
    EofInVariableName,

    #[error("empty variable name at byte offset {0}")]
    EmptyVariableName(usize),

    #[error("invalid character in variable name at byte offset {0}")]
    InvalidCharInVariableName(usize),

    #[error("package {0:?} is not imported")]
    PackageNotImported(SmolStr),

    #[error("variable {0:?} is not defined")]
    UndefinedVariable(SmolStr),
}

/// What a reference resolved to: a variable with an identity, or a name
/// written through verbatim (Ninja builtins like `in`/`out` and declared
/// rule arguments, which only exist in Ninja's own rule and build
/// scopes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    Variable(VariableId),
    Verbatim(SmolStr),
}

/// Resolves a (possibly package-qualified) variable name.
pub trait VarLookup {
    fn lookup_var(&self, pkg: Option<&str>, name: &str) -> Result<Resolved, NinjaStringError>;
}

/// Maps a variable identity back to the name it should be written as from
/// the current rendering position, already qualified with a package alias
/// where needed.
pub trait VarNames {
    fn var_name(&self, id: VariableId) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Segment {
    Literal(String),
    Var {
        id: VariableId,
        /// Whether the reference was written `${name}` rather than
        /// `$name`; kept so source-form rendering round-trips.
        braced: bool,
    },
    Verbatim {
        name: SmolStr,
        braced: bool,
    },
}

/// An immutable parsed string. `$$` has already been folded to `$` in the
/// literal segments.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NinjaString {
    pub(crate) segments: Vec<Segment>,
}

/// Escaping applied to literal text during rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escape {
    /// No escaping; for variable values.
    None,
    /// Escapes `$`, space and `:`; for input paths.
    Input,
    /// Additionally escapes `|`; for output paths.
    Output,
}

fn name_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'-'
}

impl NinjaString {
    /// A string with no references; nothing in it is interpreted.
    pub fn literal(s: impl Into<String>) -> Self {
        let s = s.into();
        if s.is_empty() {
            return Self::default();
        }
        Self {
            segments: vec![Segment::Literal(s)],
        }
    }

    /// Parse `s`, resolving references through `lookup`.
    pub fn parse(s: &str, lookup: &dyn VarLookup) -> Result<Self, NinjaStringError> {
        let bytes = s.as_bytes();
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut i = 0;

        while i < bytes.len() {
            if bytes[i] != b'$' {
                // Fast-forward to the next '$'.
                let start = i;
                while i < bytes.len() && bytes[i] != b'$' {
                    i += 1;
                }
                literal.push_str(&s[start..i]);
                continue;
            }

            i += 1;
            match bytes.get(i) {
                None => return Err(NinjaStringError::EofAfterDollar),
                Some(b'$') => {
                    literal.push('$');
                    i += 1;
                }
                Some(b'{') => {
                    i += 1;
                    let start = i;
                    let mut dot = None;
                    loop {
                        match bytes.get(i) {
                            None => return Err(NinjaStringError::EofInVariableName),
                            Some(b'}') => break,
                            Some(b'.') if dot.is_none() && i > start => {
                                dot = Some(i);
                                i += 1;
                            }
                            Some(&c) if name_char(c) => i += 1,
                            Some(_) => {
                                return Err(NinjaStringError::InvalidCharInVariableName(i));
                            }
                        }
                    }
                    if i == start {
                        return Err(NinjaStringError::EmptyVariableName(i));
                    }
                    let (pkg, name) = match dot {
                        Some(d) => (Some(&s[start..d]), &s[d + 1..i]),
                        None => (None, &s[start..i]),
                    };
                    if name.is_empty() {
                        return Err(NinjaStringError::EmptyVariableName(i));
                    }
                    flush(&mut segments, &mut literal);
                    segments.push(segment(lookup.lookup_var(pkg, name)?, true));
                    i += 1; // closing brace
                }
                Some(&c) if name_char(c) => {
                    let start = i;
                    while i < bytes.len() && name_char(bytes[i]) {
                        i += 1;
                    }
                    flush(&mut segments, &mut literal);
                    segments.push(segment(lookup.lookup_var(None, &s[start..i])?, false));
                }
                Some(_) => return Err(NinjaStringError::InvalidCharAfterDollar(i)),
            }
        }

        flush(&mut segments, &mut literal);
        Ok(Self { segments })
    }

    /// The referenced variable identities, in order of appearance.
    /// Verbatim references have no identity and are not yielded.
    pub fn references(&self) -> impl Iterator<Item = VariableId> + '_ {
        self.segments.iter().filter_map(|seg| match seg {
            Segment::Var { id, .. } => Some(*id),
            _ => None,
        })
    }

    /// Render for a Ninja file: literals escaped per `escape`, references
    /// written `${qualified}`.
    pub fn render(&self, names: &dyn VarNames, escape: Escape) -> String {
        let mut out = String::new();
        for seg in &self.segments {
            match seg {
                Segment::Literal(text) => escape_into(&mut out, text, escape),
                Segment::Var { id, .. } => {
                    out.push_str("${");
                    out.push_str(&names.var_name(*id));
                    out.push('}');
                }
                Segment::Verbatim { name, .. } => {
                    out.push_str("${");
                    out.push_str(name);
                    out.push('}');
                }
            }
        }
        out
    }

    /// Render in source form: literals unescaped, references in the brace
    /// style they were written with. Parsing then source-rendering a valid
    /// string reproduces it modulo `$$` folding.
    pub fn render_source(&self, names: &dyn VarNames) -> String {
        let mut out = String::new();
        for seg in &self.segments {
            let (text, braced) = match seg {
                Segment::Literal(text) => {
                    out.push_str(text);
                    continue;
                }
                Segment::Var { id, braced } => (names.var_name(*id), *braced),
                Segment::Verbatim { name, braced } => (name.to_string(), *braced),
            };
            if braced {
                out.push_str("${");
                out.push_str(&text);
                out.push('}');
            } else {
                out.push('$');
                out.push_str(&text);
            }
        }
        out
    }

    /// The literal text, if the string contains no references.
    pub fn as_literal(&self) -> Option<&str> {
        match self.segments.as_slice() {
            [] => Some(""),
            [Segment::Literal(text)] => Some(text),
            _ => None,
        }
    }
}

fn flush(segments: &mut Vec<Segment>, literal: &mut String) {
    if !literal.is_empty() {
        segments.push(Segment::Literal(std::mem::take(literal)));
    }
}

fn segment(resolved: Resolved, braced: bool) -> Segment {
    match resolved {
        Resolved::Variable(id) => Segment::Var { id, braced },
        Resolved::Verbatim(name) => Segment::Verbatim { name, braced },
    }
}

/// Names Ninja defines in its own rule and build scopes; they resolve
/// everywhere and are written through untouched.
pub fn is_builtin(name: &str) -> bool {
    matches!(name, "in" | "out" | "in_newline" | "out_newline")
}

fn escape_into(out: &mut String, text: &str, escape: Escape) {
    match escape {
        Escape::None => out.push_str(text),
        Escape::Input | Escape::Output => {
            for c in text.chars() {
                match c {
                    '$' => out.push_str("$$"),
                    ' ' => out.push_str("$ "),
                    ':' => out.push_str("$:"),
                    '|' if escape == Escape::Output => out.push_str("$|"),
                    other => out.push(other),
                }
            }
        }
    }
}

/// Escape a plain string for a Ninja file position.
pub fn escape(text: &str, mode: Escape) -> String {
    let mut out = String::with_capacity(text.len());
    escape_into(&mut out, text, mode);
    out
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    /// Interns every name it is asked for, and maps ids back to names
    /// for identity-preserving rendering.
    #[derive(Default)]
    struct Interner {
        names: RefCell<Vec<String>>,
    }

    impl VarLookup for Interner {
        fn lookup_var(&self, pkg: Option<&str>, name: &str) -> Result<Resolved, NinjaStringError> {
            let full = match pkg {
                Some(pkg) => format!("{pkg}.{name}"),
                None => name.to_string(),
            };
            let mut names = self.names.borrow_mut();
            let idx = names.iter().position(|n| *n == full).unwrap_or_else(|| {
                names.push(full);
                names.len() - 1
            });
            Ok(Resolved::Variable(VariableId::new(0, idx)))
        }
    }

    impl VarNames for Interner {
        fn var_name(&self, id: VariableId) -> String {
            self.names.borrow()[id.index()].clone()
        }
    }

    fn refs(input: &str) -> Vec<String> {
        let interner = Interner::default();
        let parsed = NinjaString::parse(input, &interner).unwrap();
        parsed
            .references()
            .map(|id| interner.var_name(id))
            .collect()
    }

    fn parse_err(input: &str) -> String {
        let interner = Interner::default();
        NinjaString::parse(input, &interner).unwrap_err().to_string()
    }

    #[test]
    fn plain_reference() {
        assert_eq!(refs("abc def $ghi jkl"), vec!["ghi"]);
    }

    #[test]
    fn dollar_escape_has_no_refs() {
        assert_eq!(refs("foo $$ bar"), Vec::<String>::new());
    }

    #[test]
    fn braced_and_qualified_references() {
        assert_eq!(refs("${a} ${pkg.b}$c"), vec!["a", "pkg.b", "c"]);
    }

    #[test]
    fn invalid_character_after_dollar() {
        assert_eq!(
            parse_err("foo $ bar"),
            "invalid character after '$' at byte offset 5"
        );
    }

    #[test]
    fn unterminated_brace() {
        assert_eq!(
            parse_err("foo ${abc"),
            "unexpected end of string in variable name"
        );
    }

    #[test]
    fn empty_variable_name() {
        assert_eq!(parse_err("foo ${}"), "empty variable name at byte offset 6");
    }

    #[test]
    fn end_of_string_after_dollar() {
        assert_eq!(parse_err("foo $"), "unexpected end of string after '$'");
    }

    #[test]
    fn invalid_character_inside_braces() {
        assert_eq!(
            parse_err("foo ${a b}"),
            "invalid character in variable name at byte offset 7"
        );
    }

    // Parsing then source-rendering reproduces the input modulo `$$`.
    #[test]
    fn source_render_round_trips() {
        let interner = Interner::default();
        for input in [
            "abc def $ghi jkl",
            "plain text",
            "${a}${b} mixed $c end",
            "spaces and : colons",
        ] {
            let parsed = NinjaString::parse(input, &interner).unwrap();
            assert_eq!(parsed.render_source(&interner), *input);
        }
        let parsed = NinjaString::parse("foo $$ bar", &interner).unwrap();
        assert_eq!(parsed.render_source(&interner), "foo $ bar");
    }

    #[test]
    fn escaping_modes() {
        assert_eq!(escape("a b", Escape::Input), "a$ b");
        assert_eq!(escape("a:b", Escape::Input), "a$:b");
        assert_eq!(escape("a$b", Escape::Input), "a$$b");
        assert_eq!(escape("a|b", Escape::Input), "a|b");
        assert_eq!(escape("a|b", Escape::Output), "a$|b");
        assert_eq!(escape("a b", Escape::None), "a b");
    }
}
