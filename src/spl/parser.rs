//! Parser for the call syntax:
//!
//! ```text
//! memory(mode = short);
//! retrieve("kb", top_k = 3)   # trailing semicolon optional
//! prompt(template = """Answer {query} using {context}""");
//! chat()
//! ```
//!
//! Values are strings (`"…"`, `'…'`, `"""…"""`), numbers, `true`/`false`/`null`,
//! bare identifiers (read as strings) and `[...]` lists. `#` and `//` start
//! line comments.

use serde_json::{Number, Value};

use crate::domain::function::FunctionDefinition;
use crate::error::{SourcePosition, ValidationError, ValidationErrorKind};

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Num(Number),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Eq,
    Semi,
}

impl Tok {
    fn describe(&self) -> String {
        match self {
            Self::Ident(name) => format!("identifier `{name}`"),
            Self::Str(_) => "string".to_string(),
            Self::Num(n) => format!("number `{n}`"),
            Self::LParen => "`(`".to_string(),
            Self::RParen => "`)`".to_string(),
            Self::LBracket => "`[`".to_string(),
            Self::RBracket => "`]`".to_string(),
            Self::Comma => "`,`".to_string(),
            Self::Eq => "`=`".to_string(),
            Self::Semi => "`;`".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct Spanned {
    tok: Tok,
    start: usize,
    end: usize,
}

/// Parse `source` into definitions in statement order.
///
/// Only the grammar is checked here; function kinds and parameters are
/// validated later.
///
/// # Errors
///
/// Returns a syntax [`ValidationError`] at the first offending character.
pub fn parse_calls(source: &str) -> Result<Vec<FunctionDefinition>, ValidationError> {
    let tokens = Lexer::new(source).tokenize()?;
    Parser {
        source,
        tokens,
        pos: 0,
    }
    .program()
}

fn syntax_error(source: &str, offset: usize, message: impl Into<String>) -> ValidationError {
    ValidationError::new(
        ValidationErrorKind::Syntax(message.into()),
        SourcePosition::locate(source, offset),
        snippet(source, offset),
    )
}

/// The rest of the line starting at `offset`, shortened for messages.
fn snippet(source: &str, offset: usize) -> String {
    let rest = source.get(offset..).unwrap_or_default();
    let line = rest.lines().next().unwrap_or_default().trim_end();
    match line.char_indices().nth(40) {
        Some((cut, _)) => format!("{}…", &line[..cut]),
        None => line.to_string(),
    }
}

// =============================================================================
// Lexer
// =============================================================================

struct Lexer<'a> {
    source: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self { source, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.source[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn tokenize(mut self) -> Result<Vec<Spanned>, ValidationError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia();
            let start = self.pos;
            let Some(ch) = self.peek() else {
                return Ok(tokens);
            };
            let tok = match ch {
                '(' => self.single(Tok::LParen),
                ')' => self.single(Tok::RParen),
                '[' => self.single(Tok::LBracket),
                ']' => self.single(Tok::RBracket),
                ',' => self.single(Tok::Comma),
                '=' => self.single(Tok::Eq),
                ';' => self.single(Tok::Semi),
                '"' | '\'' => Tok::Str(self.string(ch)?),
                c if c == '-' || c.is_ascii_digit() => Tok::Num(self.number()?),
                c if c.is_alphabetic() || c == '_' => Tok::Ident(self.ident()),
                other => {
                    return Err(syntax_error(self.source, start, format!("unexpected character `{other}`")));
                }
            };
            tokens.push(Spanned {
                tok,
                start,
                end: self.pos,
            });
        }
    }

    fn single(&mut self, tok: Tok) -> Tok {
        self.bump();
        tok
    }

    fn skip_trivia(&mut self) {
        loop {
            let rest = self.rest();
            let trimmed = rest.trim_start();
            self.pos += rest.len() - trimmed.len();
            if trimmed.starts_with('#') || trimmed.starts_with("//") {
                let line_len = trimmed.find('\n').unwrap_or(trimmed.len());
                self.pos += line_len;
            } else {
                return;
            }
        }
    }

    fn ident(&mut self) -> String {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_alphanumeric() || c == '_') {
            self.bump();
        }
        self.source[start..self.pos].to_string()
    }

    fn number(&mut self) -> Result<Number, ValidationError> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.bump();
        }
        let mut float = false;
        while let Some(c) = self.peek() {
            match c {
                '0'..='9' => {}
                '.' | 'e' | 'E' => float = true,
                '+' | '-' if float => {}
                _ => break,
            }
            self.bump();
        }
        let text = &self.source[start..self.pos];
        let parsed = if float {
            text.parse::<f64>().ok().and_then(Number::from_f64)
        } else {
            text.parse::<i64>().ok().map(Number::from)
        };
        parsed.ok_or_else(|| syntax_error(self.source, start, format!("invalid number `{text}`")))
    }

    fn string(&mut self, quote: char) -> Result<String, ValidationError> {
        let start = self.pos;
        if quote == '"' && self.rest().starts_with(r#"""""#) {
            self.pos += 3;
            let Some(len) = self.rest().find(r#"""""#) else {
                return Err(syntax_error(self.source, start, "unterminated triple-quoted string"));
            };
            let text = self.rest()[..len].to_string();
            self.pos += len + 3;
            return Ok(text);
        }

        self.bump();
        let mut out = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => {
                    return Err(syntax_error(self.source, start, "unterminated string"));
                }
                Some(c) if c == quote => return Ok(out),
                Some('\\') => {
                    let escape_at = self.pos - 1;
                    let escaped = match self.bump() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('r') => '\r',
                        Some('0') => '\0',
                        Some(c @ ('\\' | '"' | '\'')) => c,
                        Some(other) => {
                            return Err(syntax_error(
                                self.source,
                                escape_at,
                                format!("unknown escape `\\{other}`"),
                            ));
                        }
                        None => return Err(syntax_error(self.source, start, "unterminated string")),
                    };
                    out.push(escaped);
                }
                Some(c) => out.push(c),
            }
        }
    }
}

// =============================================================================
// Parser
// =============================================================================

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Spanned> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Spanned> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn at(&self, tok: &Tok) -> bool {
        self.peek().is_some_and(|t| &t.tok == tok)
    }

    fn end_offset(&self) -> usize {
        self.source.len()
    }

    fn unexpected(&self, expected: &str) -> ValidationError {
        match self.peek() {
            Some(t) => syntax_error(
                self.source,
                t.start,
                format!("expected {expected}, found {}", t.tok.describe()),
            ),
            None => syntax_error(
                self.source,
                self.end_offset(),
                format!("expected {expected}, found end of input"),
            ),
        }
    }

    fn expect(&mut self, tok: &Tok, expected: &str) -> Result<Spanned, ValidationError> {
        if self.at(tok) {
            self.next().ok_or_else(|| self.unexpected(expected))
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn program(&mut self) -> Result<Vec<FunctionDefinition>, ValidationError> {
        let mut definitions = Vec::new();
        while self.peek().is_some() {
            if self.at(&Tok::Semi) {
                self.next();
                continue;
            }
            let def = self.statement(definitions.len())?;
            definitions.push(def);
        }
        Ok(definitions)
    }

    fn statement(&mut self, index: usize) -> Result<FunctionDefinition, ValidationError> {
        let (name, start) = match self.peek() {
            Some(Spanned {
                tok: Tok::Ident(name),
                start,
                ..
            }) => (name.clone(), *start),
            _ => return Err(self.unexpected("function name")),
        };
        self.next();
        self.expect(&Tok::LParen, "`(`")?;

        let mut def = FunctionDefinition::new(name, index);
        def.position = SourcePosition::locate(self.source, start);

        let mut seen_keyword = false;
        while !self.at(&Tok::RParen) {
            let keyword = match (self.tokens.get(self.pos), self.tokens.get(self.pos + 1)) {
                (
                    Some(Spanned {
                        tok: Tok::Ident(key), ..
                    }),
                    Some(Spanned { tok: Tok::Eq, .. }),
                ) => Some(key.clone()),
                _ => None,
            };

            match keyword {
                Some(key) => {
                    let key_start = self.peek().map_or(start, |t| t.start);
                    self.pos += 2;
                    let value = self.value()?;
                    if def.parameters.insert(key.clone(), value).is_some() {
                        return Err(ValidationError::new(
                            ValidationErrorKind::DuplicateParameter {
                                function: def.kind.clone(),
                                parameter: key,
                            },
                            SourcePosition::locate(self.source, key_start),
                            snippet(self.source, key_start),
                        ));
                    }
                    seen_keyword = true;
                }
                None if seen_keyword => {
                    let at = self.peek().map_or(self.end_offset(), |t| t.start);
                    return Err(syntax_error(
                        self.source,
                        at,
                        "positional argument after keyword arguments",
                    ));
                }
                None => {
                    let value = self.value()?;
                    def.arguments.push(value);
                }
            }

            if !self.at(&Tok::Comma) {
                break;
            }
            self.next();
        }
        let close = self.expect(&Tok::RParen, "`,` or `)`")?;
        let mut end = close.end;
        if self.at(&Tok::Semi) {
            end = self.next().map_or(end, |t| t.end);
        }

        def.fragment = self.source[start..end].trim().to_string();
        Ok(def)
    }

    fn value(&mut self) -> Result<Value, ValidationError> {
        let Some(token) = self.next() else {
            return Err(self.unexpected("a value"));
        };
        Ok(match token.tok {
            Tok::Str(s) => Value::String(s),
            Tok::Num(n) => Value::Number(n),
            Tok::Ident(word) => match word.as_str() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                "null" => Value::Null,
                _ => Value::String(word),
            },
            Tok::LBracket => {
                let mut items = Vec::new();
                while !self.at(&Tok::RBracket) {
                    items.push(self.value()?);
                    if !self.at(&Tok::Comma) {
                        break;
                    }
                    self.next();
                }
                self.expect(&Tok::RBracket, "`,` or `]`")?;
                Value::Array(items)
            }
            _ => {
                self.pos -= 1;
                return Err(self.unexpected("a value"));
            }
        })
    }
}
