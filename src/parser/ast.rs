//! AST for the Blueprints module-definition language.

use smol_str::SmolStr;

/// A position in a Blueprints file. Lines and columns are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pos {
    pub line: u32,
    pub col: u32,
}

impl std::fmt::Display for Pos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// One parsed Blueprints file.
#[derive(Debug, Default)]
pub struct BlueprintFile {
    /// Path of the file, as given to the parser.
    pub name: SmolStr,
    pub defs: Vec<Definition>,
}

/// A top-level definition: a variable assignment or a module call.
#[derive(Debug)]
pub enum Definition {
    Assignment(Assignment),
    Module(ModuleCall),
}

/// `name = value` or `name += value`.
#[derive(Debug)]
pub struct Assignment {
    pub name: SmolStr,
    pub name_pos: Pos,
    pub value: Value,
    pub append: bool,
}

/// `module_type { name: "foo", ... }`.
#[derive(Debug)]
pub struct ModuleCall {
    pub type_name: SmolStr,
    pub type_pos: Pos,
    pub props: Vec<Property>,
    /// Line range covered by the call, for error reporting.
    pub end_line: u32,
}

/// A named property inside a module call or map value.
#[derive(Debug, Clone)]
pub struct Property {
    pub name: SmolStr,
    pub pos: Pos,
    pub value: Value,
}

/// A property value, fully evaluated: variable references and `+`
/// concatenations are resolved by the parser, so consumers only see the
/// five literal shapes.
#[derive(Debug, Clone)]
pub enum Value {
    String(Pos, String),
    Bool(Pos, bool),
    Int(Pos, i64),
    List(Pos, Vec<Value>),
    Map(Pos, Vec<Property>),
}

impl Value {
    pub fn pos(&self) -> Pos {
        match self {
            Value::String(p, _)
            | Value::Bool(p, _)
            | Value::Int(p, _)
            | Value::List(p, _)
            | Value::Map(p, _) => *p,
        }
    }

    /// The name of the value's type, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::String(..) => "string",
            Value::Bool(..) => "bool",
            Value::Int(..) => "int",
            Value::List(..) => "list",
            Value::Map(..) => "map",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(_, s) => Some(s),
            _ => None,
        }
    }

    /// The elements of a list of strings, if this is one.
    pub fn as_string_list(&self) -> Option<Vec<&str>> {
        match self {
            Value::List(_, elems) => elems.iter().map(|e| e.as_str()).collect(),
            _ => None,
        }
    }
}
