use logos::Logos;

use super::ast::Pos;

/// Tokens of the Blueprints language.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Logos)]
#[logos(skip r"[ \t\r\n]+")]
#[logos(skip r"//[^\n]*")]
#[logos(skip r"/\*(?:[^*]|\*+[^*/])*\*+/")]
pub(super) enum Token<'s> {
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*")]
    Ident(&'s str),

    /// A double-quoted string literal, escapes unresolved.
    #[regex(r#""(?:[^"\\\n]|\\.)*""#)]
    String(&'s str),

    #[regex(r"-?[0-9]+")]
    Int(&'s str),

    #[token("=")]
    Assign,

    #[token("+=")]
    AppendAssign,

    #[token("+")]
    Plus,

    #[token("{")]
    LBrace,

    #[token("}")]
    RBrace,

    #[token("[")]
    LBracket,

    #[token("]")]
    RBracket,

    #[token("(")]
    LParen,

    #[token(")")]
    RParen,

    #[token(":")]
    Colon,

    #[token(",")]
    Comma,
}

impl Token<'_> {
    /// A short description for error messages.
    pub(super) fn describe(&self) -> String {
        match self {
            Token::Ident(s) => format!("identifier {s:?}"),
            Token::String(_) => "string literal".to_string(),
            Token::Int(s) => format!("number {s}"),
            Token::Assign => "'='".to_string(),
            Token::AppendAssign => "'+='".to_string(),
            Token::Plus => "'+'".to_string(),
            Token::LBrace => "'{'".to_string(),
            Token::RBrace => "'}'".to_string(),
            Token::LBracket => "'['".to_string(),
            Token::RBracket => "']'".to_string(),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
            Token::Colon => "':'".to_string(),
            Token::Comma => "','".to_string(),
        }
    }
}

/// Maps byte offsets to line/column positions.
pub(super) struct LineIndex {
    /// Byte offset of the start of each line.
    starts: Vec<usize>,
}

impl LineIndex {
    pub(super) fn new(src: &str) -> Self {
        let mut starts = vec![0];
        for (i, b) in src.bytes().enumerate() {
            if b == b'\n' {
                starts.push(i + 1);
            }
        }
        Self { starts }
    }

    pub(super) fn pos(&self, offset: usize) -> Pos {
        let line = self.starts.partition_point(|&s| s <= offset);
        Pos {
            line: line as u32,
            col: (offset - self.starts[line - 1] + 1) as u32,
        }
    }
}

/// A peekable wrapper over the logos lexer that tracks token spans.
pub(super) struct Lexer<'s> {
    inner: logos::Lexer<'s, Token<'s>>,
    peeked: Option<Option<Result<Token<'s>, ()>>>,
    peeked_span: std::ops::Range<usize>,
    lines: LineIndex,
}

impl<'s> Lexer<'s> {
    pub(super) fn new(src: &'s str) -> Self {
        Self {
            inner: Token::lexer(src),
            peeked: None,
            peeked_span: 0..0,
            lines: LineIndex::new(src),
        }
    }

    pub(super) fn peek(&mut self) -> Option<Result<Token<'s>, ()>> {
        if self.peeked.is_none() {
            let next = self.inner.next();
            self.peeked_span = self.inner.span();
            self.peeked = Some(next);
        }
        self.peeked.clone().unwrap()
    }

    pub(super) fn bump(&mut self) -> Option<Result<Token<'s>, ()>> {
        match self.peeked.take() {
            Some(tok) => tok,
            None => {
                let next = self.inner.next();
                self.peeked_span = self.inner.span();
                next
            }
        }
    }

    /// Position of the most recently peeked or bumped token.
    pub(super) fn pos(&self) -> Pos {
        self.lines.pos(self.peeked_span.start)
    }

    /// Position just past the end of the source.
    pub(super) fn eof_pos(&self) -> Pos {
        self.lines.pos(self.inner.source().len())
    }
}
