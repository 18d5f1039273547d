//! Declarative mini-language for webhook-scoped scalar UDFs.
//!
//! UDF source text contains one or more definitions of the form
//!
//! ```text
//! fn extract_jira_key(message: str) -> str {
//!     regexp_extract(message, '[A-Z]+-[0-9]+', 0)
//! }
//! ```
//!
//! The body is a SQL scalar expression evaluated by the engine. Parameter
//! and return types default to text; the optional hints `str`, `int`,
//! `float` and `bool` map to VARCHAR, BIGINT, DOUBLE and BOOLEAN. The
//! installer compiles a definition into an engine macro under the
//! webhook-scoped physical name, so user SQL calls a stable function and
//! the source is compiled exactly once per registration.

use crate::error::GatewayError;
use crate::GatewayResult;

// ============================================================================
// Types
// ============================================================================

/// Declared parameter or return type of a UDF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdfType {
    Text,
    Int,
    Float,
    Bool,
}

impl UdfType {
    /// Parse a type hint. Absent hints default to [`UdfType::Text`].
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "str" => Some(Self::Text),
            "int" => Some(Self::Int),
            "float" => Some(Self::Float),
            "bool" => Some(Self::Bool),
            _ => None,
        }
    }

    /// The engine-side type this hint maps to.
    pub fn engine_type(&self) -> &'static str {
        match self {
            Self::Text => "VARCHAR",
            Self::Int => "BIGINT",
            Self::Float => "DOUBLE",
            Self::Bool => "BOOLEAN",
        }
    }
}

/// A single parameter of a UDF definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdfParam {
    pub name: String,
    pub ty: UdfType,
}

/// One parsed top-level definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdfDef {
    pub name: String,
    pub params: Vec<UdfParam>,
    pub return_type: UdfType,
    pub body: String,
}

impl UdfDef {
    /// Number of parameters.
    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// Compile this definition into a `CREATE OR REPLACE MACRO` statement
    /// under `physical_name`.
    ///
    /// Parameters arrive as `__arg0..__argN` and are cast to their declared
    /// types under the user's parameter names; the body's result is cast to
    /// the declared return type.
    pub fn compile(&self, physical_name: &str) -> String {
        let outer: Vec<String> = (0..self.params.len())
            .map(|i| format!("__arg{i}"))
            .collect();
        let casts: Vec<String> = self
            .params
            .iter()
            .zip(&outer)
            .map(|(param, arg)| {
                format!("CAST({arg} AS {}) AS {}", param.ty.engine_type(), param.name)
            })
            .collect();

        format!(
            "CREATE OR REPLACE MACRO {physical_name}({}) AS \
             (SELECT CAST(({}) AS {}) FROM (SELECT {}) __args)",
            outer.join(", "),
            self.body,
            self.return_type.engine_type(),
            casts.join(", "),
        )
    }

    /// A probe invocation with NULL arguments, used to surface binding
    /// errors in the body right after compilation.
    pub fn probe_call(&self, physical_name: &str) -> String {
        let nulls = vec!["NULL"; self.params.len()].join(", ");
        format!("SELECT {physical_name}({nulls})")
    }
}

// ============================================================================
// Parsing
// ============================================================================

/// Parse every top-level definition in `source`.
///
/// Fails `Invalid` on syntax errors, unknown type hints, duplicate
/// definitions, empty bodies, or parameter names that collide with the
/// compiler's internal argument names.
pub fn parse_source(source: &str) -> GatewayResult<Vec<UdfDef>> {
    let mut parser = Parser::new(source);
    let mut defs: Vec<UdfDef> = Vec::new();

    loop {
        parser.skip_whitespace();
        if parser.at_end() {
            break;
        }
        let def = parser.parse_definition()?;
        if defs.iter().any(|d| d.name == def.name) {
            return Err(GatewayError::invalid(format!(
                "duplicate definition of '{}'",
                def.name
            )));
        }
        defs.push(def);
    }

    if defs.is_empty() {
        return Err(GatewayError::invalid(
            "UDF source contains no function definitions",
        ));
    }
    Ok(defs)
}

/// Find the definition named `name` among the parsed top-level definitions.
pub fn find_definition(defs: &[UdfDef], name: &str) -> GatewayResult<UdfDef> {
    defs.iter()
        .find(|d| d.name == name)
        .cloned()
        .ok_or_else(|| {
            GatewayError::invalid(format!(
                "function '{name}' not found at the top level of the source"
            ))
        })
}

struct Parser<'a> {
    chars: Vec<char>,
    pos: usize,
    source: &'a str,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            source,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn error(&self, message: impl Into<String>) -> GatewayError {
        GatewayError::invalid(format!(
            "UDF parse error at offset {}: {}",
            self.pos,
            message.into()
        ))
    }

    fn expect_char(&mut self, expected: char) -> GatewayResult<()> {
        self.skip_whitespace();
        match self.bump() {
            Some(c) if c == expected => Ok(()),
            Some(c) => Err(self.error(format!("expected '{expected}', found '{c}'"))),
            None => Err(self.error(format!("expected '{expected}', found end of input"))),
        }
    }

    fn parse_identifier(&mut self) -> GatewayResult<String> {
        self.skip_whitespace();
        let mut ident = String::new();
        match self.peek() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                ident.push(c);
                self.pos += 1;
            }
            Some(c) => return Err(self.error(format!("expected identifier, found '{c}'"))),
            None => return Err(self.error("expected identifier, found end of input")),
        }
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                ident.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }
        Ok(ident)
    }

    fn parse_type(&mut self) -> GatewayResult<UdfType> {
        let name = self.parse_identifier()?;
        UdfType::parse(&name).ok_or_else(|| {
            self.error(format!(
                "unknown type '{name}' (expected str, int, float or bool)"
            ))
        })
    }

    fn parse_definition(&mut self) -> GatewayResult<UdfDef> {
        let keyword = self.parse_identifier()?;
        if keyword != "fn" {
            return Err(self.error(format!("expected 'fn', found '{keyword}'")));
        }

        let name = self.parse_identifier()?;
        self.expect_char('(')?;

        let mut params = Vec::new();
        loop {
            self.skip_whitespace();
            if self.peek() == Some(')') {
                self.pos += 1;
                break;
            }
            let param_name = self.parse_identifier()?;
            if param_name.starts_with("__") {
                return Err(self.error(format!(
                    "parameter name '{param_name}' is reserved"
                )));
            }
            self.skip_whitespace();
            let ty = if self.peek() == Some(':') {
                self.pos += 1;
                self.parse_type()?
            } else {
                UdfType::Text
            };
            params.push(UdfParam { name: param_name, ty });

            self.skip_whitespace();
            match self.peek() {
                Some(',') => {
                    self.pos += 1;
                }
                Some(')') => {}
                Some(c) => return Err(self.error(format!("expected ',' or ')', found '{c}'"))),
                None => return Err(self.error("unterminated parameter list")),
            }
        }

        self.skip_whitespace();
        let return_type = if self.peek() == Some('-') {
            self.expect_char('-')?;
            self.expect_char('>')?;
            self.parse_type()?
        } else {
            UdfType::Text
        };

        self.expect_char('{')?;
        let body = self.parse_body()?;
        if body.trim().is_empty() {
            return Err(self.error(format!("function '{name}' has an empty body")));
        }

        Ok(UdfDef {
            name,
            params,
            return_type,
            body: body.trim().to_string(),
        })
    }

    /// Consume a brace-balanced body, honoring SQL string and quoted
    /// identifier syntax so braces inside literals do not end the body.
    fn parse_body(&mut self) -> GatewayResult<String> {
        let start = self.char_offset_to_byte(self.pos);
        let mut depth = 1usize;

        while let Some(c) = self.bump() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        let end = self.char_offset_to_byte(self.pos - 1);
                        return Ok(self.source[start..end].to_string());
                    }
                }
                '\'' => self.skip_quoted('\'')?,
                '"' => self.skip_quoted('"')?,
                _ => {}
            }
        }
        Err(self.error("unterminated function body"))
    }

    /// Skip to the closing quote; a doubled quote is the SQL escape.
    fn skip_quoted(&mut self, quote: char) -> GatewayResult<()> {
        while let Some(c) = self.bump() {
            if c == quote {
                if self.peek() == Some(quote) {
                    self.pos += 1;
                    continue;
                }
                return Ok(());
            }
        }
        Err(self.error(format!("unterminated {quote}-quoted literal")))
    }

    fn char_offset_to_byte(&self, char_offset: usize) -> usize {
        self.chars[..char_offset].iter().map(|c| c.len_utf8()).sum()
    }
}

#[cfg(test)]
#[path = "udf_tests.rs"]
mod tests;
