//! Parsing of Blueprints files.
//!
//! The parser is reentrant and performs no I/O itself: the multi-file
//! loader [`parse_tree`] reads files through a [`SourceTree`] supplied by
//! the caller. Variable references and `+` concatenations are evaluated
//! during parsing, so the produced AST contains only literal values.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use smol_str::SmolStr;
use tracing::debug;

pub mod ast;
mod lexer;

pub use ast::{Assignment, BlueprintFile, Definition, ModuleCall, Pos, Property, Value};

use crate::source::SourceTree;
use lexer::{Lexer, Token};

/// Errors produced while parsing a Blueprints file.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("{file}:{pos}: unrecognized character")]
    UnrecognizedToken { file: SmolStr, pos: Pos },

    #[error("{file}:{pos}: unexpected {found}, expected {expected}")]
    UnexpectedToken {
        file: SmolStr,
        pos: Pos,
        found: String,
        expected: String,
    },

    #[error("{file}:{pos}: unexpected end of file while {context}")]
    UnexpectedEof {
        file: SmolStr,
        pos: Pos,
        context: String,
    },

    #[error("{file}:{pos}: invalid escape sequence \\{0} in string", .escape)]
    InvalidEscape {
        file: SmolStr,
        pos: Pos,
        escape: char,
    },

    #[error("{file}:{pos}: integer {literal} out of range")]
    IntOutOfRange {
        file: SmolStr,
        pos: Pos,
        literal: String,
    },

    #[error("{file}:{pos}: variable {name} is not defined")]
    UndefinedVariable {
        file: SmolStr,
        pos: Pos,
        name: SmolStr,
    },

    #[error("{file}:{pos}: variable {name} is already defined at {prev}")]
    RedefinedVariable {
        file: SmolStr,
        pos: Pos,
        name: SmolStr,
        prev: Pos,
    },

    #[error("{file}:{pos}: cannot append to variable {name}, it was referenced at {referenced}")]
    AppendAfterReference {
        file: SmolStr,
        pos: Pos,
        name: SmolStr,
        referenced: Pos,
    },

    #[error("{file}:{pos}: cannot concatenate {left} and {right}")]
    ConcatMismatch {
        file: SmolStr,
        pos: Pos,
        left: &'static str,
        right: &'static str,
    },

    #[error("{file}:{pos}: {directive} must be a list of strings")]
    BadDirective {
        file: SmolStr,
        pos: Pos,
        directive: SmolStr,
    },

    #[error("{file}:{pos}: unsupported pattern {pattern:?} in {directive}")]
    BadSubdirPattern {
        file: SmolStr,
        pos: Pos,
        pattern: String,
        directive: SmolStr,
    },

    #[error("failed to read {file}: {message}")]
    Read { file: SmolStr, message: String },
}

/// Structural directives extracted from assignments; these never reach
/// property binding.
#[derive(Debug, Default)]
pub struct Directives {
    pub subdirs: Vec<(String, Pos)>,
    pub optional_subdirs: Vec<(String, Pos)>,
    /// Additional Blueprints files in the same directory.
    pub build: Vec<(String, Pos)>,
}

/// The outcome of parsing a single file. Errors are accumulated so that a
/// single run reports as many problems as possible.
#[derive(Debug)]
pub struct ParsedFile {
    pub file: BlueprintFile,
    pub directives: Directives,
    pub errors: Vec<ParseError>,
}

struct VarDef {
    value: Value,
    pos: Pos,
    /// Position of the first reference, if any. Appending to a variable
    /// that has already been referenced is an error.
    referenced: Option<Pos>,
}

struct Parser<'s> {
    file: SmolStr,
    lexer: Lexer<'s>,
    scope: IndexMap<SmolStr, VarDef>,
    errors: Vec<ParseError>,
}

/// Parse one Blueprints file. Never fails outright: syntax errors are
/// collected in [`ParsedFile::errors`] alongside whatever parsed cleanly.
pub fn parse(name: &str, src: &str) -> ParsedFile {
    let mut parser = Parser {
        file: SmolStr::new(name),
        lexer: Lexer::new(src),
        scope: IndexMap::new(),
        errors: Vec::new(),
    };
    let defs = parser.parse_top_level();

    let mut file = BlueprintFile {
        name: SmolStr::new(name),
        defs: Vec::new(),
    };
    let mut directives = Directives::default();
    for def in defs {
        match def {
            Definition::Assignment(a) if is_directive(&a.name) => {
                parser.collect_directive(a, &mut directives);
            }
            other => file.defs.push(other),
        }
    }

    ParsedFile {
        file,
        directives,
        errors: parser.errors,
    }
}

fn is_directive(name: &str) -> bool {
    matches!(name, "subdirs" | "optional_subdirs" | "build")
}

impl<'s> Parser<'s> {
    fn parse_top_level(&mut self) -> Vec<Definition> {
        let mut defs = Vec::new();
        loop {
            let Some(tok) = self.lexer.peek() else { break };
            let pos = self.lexer.pos();
            match tok {
                Ok(Token::Ident(name)) => {
                    let name = SmolStr::new(name);
                    self.lexer.bump();
                    if let Some(def) = self.parse_definition(name, pos) {
                        defs.push(def);
                    } else {
                        self.recover_top_level();
                    }
                }
                Ok(other) => {
                    self.errors.push(ParseError::UnexpectedToken {
                        file: self.file.clone(),
                        pos,
                        found: other.describe(),
                        expected: "a variable assignment or module definition".into(),
                    });
                    self.lexer.bump();
                    self.recover_top_level();
                }
                Err(()) => {
                    self.errors.push(ParseError::UnrecognizedToken {
                        file: self.file.clone(),
                        pos,
                    });
                    self.lexer.bump();
                    self.recover_top_level();
                }
            }
        }
        defs
    }

    /// Skip forward to something that can plausibly start a new top-level
    /// definition, keeping brace depth balanced.
    fn recover_top_level(&mut self) {
        let mut depth = 0usize;
        while let Some(tok) = self.lexer.peek() {
            match tok {
                Ok(Token::LBrace) | Ok(Token::LBracket) | Ok(Token::LParen) => depth += 1,
                Ok(Token::RBrace) | Ok(Token::RBracket) | Ok(Token::RParen) => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        self.lexer.bump();
                        return;
                    }
                }
                Ok(Token::Ident(_)) if depth == 0 => return,
                _ => {}
            }
            self.lexer.bump();
        }
    }

    fn parse_definition(&mut self, name: SmolStr, name_pos: Pos) -> Option<Definition> {
        match self.lexer.peek() {
            Some(Ok(Token::Assign)) => {
                self.lexer.bump();
                let value = self.parse_expr()?;
                self.define(name.clone(), name_pos, value.clone(), false);
                Some(Definition::Assignment(Assignment {
                    name,
                    name_pos,
                    value,
                    append: false,
                }))
            }
            Some(Ok(Token::AppendAssign)) => {
                self.lexer.bump();
                let value = self.parse_expr()?;
                let value = self.append(name.clone(), name_pos, value)?;
                Some(Definition::Assignment(Assignment {
                    name,
                    name_pos,
                    value,
                    append: true,
                }))
            }
            Some(Ok(Token::LBrace)) | Some(Ok(Token::LParen)) => {
                let props = self.parse_body()?;
                let end_line = self.lexer.pos().line;
                Some(Definition::Module(ModuleCall {
                    type_name: name,
                    type_pos: name_pos,
                    props,
                    end_line,
                }))
            }
            Some(Ok(other)) => {
                let pos = self.lexer.pos();
                self.errors.push(ParseError::UnexpectedToken {
                    file: self.file.clone(),
                    pos,
                    found: other.describe(),
                    expected: "'=', '+=' or a module body".into(),
                });
                None
            }
            Some(Err(())) => {
                self.errors.push(ParseError::UnrecognizedToken {
                    file: self.file.clone(),
                    pos: self.lexer.pos(),
                });
                None
            }
            None => {
                self.eof_error("parsing a definition");
                None
            }
        }
    }

    /// Parse `{ name: value, ... }` or the equivalent parenthesized form.
    fn parse_body(&mut self) -> Option<Vec<Property>> {
        let open = self.lexer.bump();
        let close = match open {
            Some(Ok(Token::LBrace)) => Token::RBrace,
            Some(Ok(Token::LParen)) => Token::RParen,
            _ => panic!("parse_body called without an opening token. This is a bug."),
        };

        let mut props = Vec::new();
        loop {
            match self.lexer.peek() {
                Some(Ok(tok)) if tok == close => {
                    self.lexer.bump();
                    return Some(props);
                }
                Some(Ok(Token::Ident(name))) => {
                    let name = SmolStr::new(name);
                    let pos = self.lexer.pos();
                    self.lexer.bump();
                    self.expect(Token::Colon, "':'")?;
                    let value = self.parse_expr()?;
                    props.push(Property { name, pos, value });
                    // Trailing commas are allowed; a missing comma before
                    // the closing token is too.
                    if let Some(Ok(Token::Comma)) = self.lexer.peek() {
                        self.lexer.bump();
                    }
                }
                Some(Ok(other)) => {
                    let pos = self.lexer.pos();
                    self.errors.push(ParseError::UnexpectedToken {
                        file: self.file.clone(),
                        pos,
                        found: other.describe(),
                        expected: "a property name".into(),
                    });
                    return None;
                }
                Some(Err(())) => {
                    self.errors.push(ParseError::UnrecognizedToken {
                        file: self.file.clone(),
                        pos: self.lexer.pos(),
                    });
                    return None;
                }
                None => {
                    self.eof_error("parsing a module body");
                    return None;
                }
            }
        }
    }

    /// Parse a value expression: one operand, or a left-to-right chain of
    /// `+` concatenations.
    fn parse_expr(&mut self) -> Option<Value> {
        let mut value = self.parse_operand()?;
        while let Some(Ok(Token::Plus)) = self.lexer.peek() {
            let plus_pos = self.lexer.pos();
            self.lexer.bump();
            let rhs = self.parse_operand()?;
            value = self.concat(value, rhs, plus_pos)?;
        }
        Some(value)
    }

    fn parse_operand(&mut self) -> Option<Value> {
        let peeked = self.lexer.peek();
        let pos = self.lexer.pos();
        match peeked {
            Some(Ok(Token::String(raw))) => {
                self.lexer.bump();
                let s = self.unescape(raw, pos)?;
                Some(Value::String(pos, s))
            }
            Some(Ok(Token::Int(raw))) => {
                self.lexer.bump();
                match raw.parse::<i64>() {
                    Ok(v) => Some(Value::Int(pos, v)),
                    Err(_) => {
                        self.errors.push(ParseError::IntOutOfRange {
                            file: self.file.clone(),
                            pos,
                            literal: raw.to_string(),
                        });
                        None
                    }
                }
            }
            Some(Ok(Token::Ident("true"))) => {
                self.lexer.bump();
                Some(Value::Bool(pos, true))
            }
            Some(Ok(Token::Ident("false"))) => {
                self.lexer.bump();
                Some(Value::Bool(pos, false))
            }
            Some(Ok(Token::Ident(name))) => {
                let name = SmolStr::new(name);
                self.lexer.bump();
                self.reference(&name, pos)
            }
            Some(Ok(Token::LBracket)) => {
                self.lexer.bump();
                let mut elems = Vec::new();
                loop {
                    if let Some(Ok(Token::RBracket)) = self.lexer.peek() {
                        self.lexer.bump();
                        break;
                    }
                    if self.lexer.peek().is_none() {
                        self.eof_error("parsing a list");
                        return None;
                    }
                    elems.push(self.parse_expr()?);
                    match self.lexer.peek() {
                        Some(Ok(Token::Comma)) => {
                            self.lexer.bump();
                        }
                        Some(Ok(Token::RBracket)) => {}
                        _ => {
                            let found = match self.lexer.peek() {
                                Some(Ok(t)) => t.describe(),
                                _ => "unrecognized character".into(),
                            };
                            self.errors.push(ParseError::UnexpectedToken {
                                file: self.file.clone(),
                                pos: self.lexer.pos(),
                                found,
                                expected: "',' or ']'".into(),
                            });
                            return None;
                        }
                    }
                }
                Some(Value::List(pos, elems))
            }
            Some(Ok(Token::LBrace)) => {
                let props = self.parse_body()?;
                Some(Value::Map(pos, props))
            }
            Some(Ok(other)) => {
                self.errors.push(ParseError::UnexpectedToken {
                    file: self.file.clone(),
                    pos,
                    found: other.describe(),
                    expected: "a value".into(),
                });
                None
            }
            Some(Err(())) => {
                self.errors.push(ParseError::UnrecognizedToken {
                    file: self.file.clone(),
                    pos,
                });
                None
            }
            None => {
                self.eof_error("parsing a value");
                None
            }
        }
    }

    fn unescape(&mut self, raw: &str, pos: Pos) -> Option<String> {
        // Strip the surrounding quotes.
        let inner = &raw[1..raw.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('"') => out.push('"'),
                Some('\\') => out.push('\\'),
                Some(other) => {
                    self.errors.push(ParseError::InvalidEscape {
                        file: self.file.clone(),
                        pos,
                        escape: other,
                    });
                    return None;
                }
                None => unreachable!("lexer guarantees escapes are followed by a character"),
            }
        }
        Some(out)
    }

    fn concat(&mut self, left: Value, right: Value, pos: Pos) -> Option<Value> {
        match (left, right) {
            (Value::String(p, mut a), Value::String(_, b)) => {
                a.push_str(&b);
                Some(Value::String(p, a))
            }
            (Value::List(p, mut a), Value::List(_, b)) => {
                a.extend(b);
                Some(Value::List(p, a))
            }
            (l, r) => {
                self.errors.push(ParseError::ConcatMismatch {
                    file: self.file.clone(),
                    pos,
                    left: l.type_name(),
                    right: r.type_name(),
                });
                None
            }
        }
    }

    fn define(&mut self, name: SmolStr, pos: Pos, value: Value, overwrite: bool) {
        if let Some(prev) = self.scope.get(&name)
            && !overwrite
        {
            self.errors.push(ParseError::RedefinedVariable {
                file: self.file.clone(),
                pos,
                name,
                prev: prev.pos,
            });
            return;
        }
        self.scope.insert(
            name,
            VarDef {
                value,
                pos,
                referenced: None,
            },
        );
    }

    fn append(&mut self, name: SmolStr, pos: Pos, value: Value) -> Option<Value> {
        let Some(def) = self.scope.get(&name) else {
            self.errors.push(ParseError::UndefinedVariable {
                file: self.file.clone(),
                pos,
                name,
            });
            return None;
        };
        if let Some(referenced) = def.referenced {
            self.errors.push(ParseError::AppendAfterReference {
                file: self.file.clone(),
                pos,
                name,
                referenced,
            });
            return None;
        }
        let combined = self.concat(def.value.clone(), value, pos)?;
        self.define(name, pos, combined.clone(), true);
        Some(combined)
    }

    fn reference(&mut self, name: &SmolStr, pos: Pos) -> Option<Value> {
        let file = self.file.clone();
        let Some(def) = self.scope.get_mut(name) else {
            self.errors.push(ParseError::UndefinedVariable {
                file,
                pos,
                name: name.clone(),
            });
            return None;
        };
        def.referenced.get_or_insert(pos);
        let mut value = def.value.clone();
        reposition(&mut value, pos);
        Some(value)
    }

    fn expect(&mut self, token: Token<'s>, describe: &str) -> Option<()> {
        match self.lexer.bump() {
            Some(Ok(tok)) if tok == token => Some(()),
            Some(Ok(other)) => {
                self.errors.push(ParseError::UnexpectedToken {
                    file: self.file.clone(),
                    pos: self.lexer.pos(),
                    found: other.describe(),
                    expected: describe.into(),
                });
                None
            }
            Some(Err(())) => {
                self.errors.push(ParseError::UnrecognizedToken {
                    file: self.file.clone(),
                    pos: self.lexer.pos(),
                });
                None
            }
            None => {
                self.eof_error(&format!("expecting {describe}"));
                None
            }
        }
    }

    fn eof_error(&mut self, context: &str) {
        self.errors.push(ParseError::UnexpectedEof {
            file: self.file.clone(),
            pos: self.lexer.eof_pos(),
            context: context.to_string(),
        });
    }

    fn collect_directive(&mut self, assignment: Assignment, directives: &mut Directives) {
        let Some(entries) = assignment.value.as_string_list() else {
            self.errors.push(ParseError::BadDirective {
                file: self.file.clone(),
                pos: assignment.value.pos(),
                directive: assignment.name.clone(),
            });
            return;
        };
        let pos = assignment.value.pos();
        let list = match assignment.name.as_str() {
            "subdirs" => &mut directives.subdirs,
            "optional_subdirs" => &mut directives.optional_subdirs,
            "build" => &mut directives.build,
            other => panic!("collect_directive called for {other}. This is a bug."),
        };
        list.extend(entries.iter().map(|e| (e.to_string(), pos)));
    }
}

/// Restamp a cloned variable value with the position of the reference, so
/// binding errors point at the use site.
fn reposition(value: &mut Value, pos: Pos) {
    match value {
        Value::String(p, _) | Value::Bool(p, _) | Value::Int(p, _) => *p = pos,
        Value::List(p, elems) => {
            *p = pos;
            for e in elems {
                reposition(e, pos);
            }
        }
        Value::Map(p, props) => {
            *p = pos;
            for prop in props {
                reposition(&mut prop.value, pos);
            }
        }
    }
}

/// The result of loading a whole Blueprints tree.
#[derive(Debug)]
pub struct ParsedTree {
    pub files: Vec<BlueprintFile>,
    /// Every file parsed, in parse order. Feeds the generation depfile.
    pub parsed: Vec<PathBuf>,
    pub errors: Vec<ParseError>,
}

/// Parse `root_files` and everything reachable from their `subdirs`,
/// `optional_subdirs` and `build` directives, breadth-first.
///
/// `srcdir` anchors relative paths; `file_name` is the Blueprints file
/// name looked for in each subdirectory.
#[tracing::instrument(skip_all)]
pub fn parse_tree(
    root_files: &[PathBuf],
    srcdir: &Path,
    file_name: &str,
    source: &dyn SourceTree,
) -> ParsedTree {
    let mut tree = ParsedTree {
        files: Vec::new(),
        parsed: Vec::new(),
        errors: Vec::new(),
    };

    let mut queue: VecDeque<(PathBuf, bool)> =
        root_files.iter().map(|p| (p.clone(), false)).collect();
    let mut seen: Vec<PathBuf> = Vec::new();

    while let Some((path, optional)) = queue.pop_front() {
        if seen.contains(&path) {
            continue;
        }
        seen.push(path.clone());

        let full = if path.is_absolute() {
            path.clone()
        } else {
            srcdir.join(&path)
        };
        let src = match source.read(&full) {
            Ok(src) => src,
            Err(e) if optional => {
                debug!("optional blueprint {} not readable: {e}", path.display());
                continue;
            }
            Err(e) => {
                tree.errors.push(ParseError::Read {
                    file: SmolStr::new(path.to_string_lossy()),
                    message: e.to_string(),
                });
                continue;
            }
        };

        let name = path.to_string_lossy();
        debug!("parsing {name}");
        let parsed = parse(&name, &src);
        tree.parsed.push(path.clone());
        tree.errors.extend(parsed.errors);

        let dir = path.parent().unwrap_or(Path::new("")).to_path_buf();
        for (entry, _) in &parsed.directives.build {
            queue.push_back((dir.join(entry), false));
        }
        for (optional, list) in [
            (false, &parsed.directives.subdirs),
            (true, &parsed.directives.optional_subdirs),
        ] {
            for (pattern, pos) in list {
                match expand_subdirs(&dir, pattern, srcdir, source) {
                    Ok(dirs) => {
                        for d in dirs {
                            queue.push_back((d.join(file_name), optional));
                        }
                    }
                    Err(()) => tree.errors.push(ParseError::BadSubdirPattern {
                        file: parsed.file.name.clone(),
                        pos: *pos,
                        pattern: pattern.clone(),
                        directive: if optional {
                            SmolStr::new_static("optional_subdirs")
                        } else {
                            SmolStr::new_static("subdirs")
                        },
                    }),
                }
            }
        }

        tree.files.push(parsed.file);
    }

    tree
}

/// Expand a `subdirs` entry relative to `dir`. Each path component may be
/// a literal name or a lone `*`; anything else is rejected.
fn expand_subdirs(
    dir: &Path,
    pattern: &str,
    srcdir: &Path,
    source: &dyn SourceTree,
) -> Result<Vec<PathBuf>, ()> {
    let mut current = vec![dir.to_path_buf()];
    for component in pattern.split('/') {
        if component.is_empty() || component == "**" {
            return Err(());
        }
        let mut next = Vec::new();
        if component == "*" {
            for base in &current {
                let full = srcdir.join(base);
                let Ok(entries) = source.list_dir(&full) else {
                    continue;
                };
                for e in entries {
                    if e.is_dir && !e.name.starts_with('.') {
                        next.push(base.join(&e.name));
                    }
                }
            }
        } else if component.contains(['*', '?', '[']) {
            return Err(());
        } else {
            for base in &current {
                next.push(base.join(component));
            }
        }
        current = next;
    }
    Ok(current
        .into_iter()
        .filter(|d| source.is_dir(&srcdir.join(d)))
        .collect())
}
