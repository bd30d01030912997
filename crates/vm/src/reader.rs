//! Datum reader used by the bytecode loader.
//!
//! Bytecode containers frame their constant pools as readable text, so
//! the loader needs enough of the language's reader to parse them:
//! booleans, exact and inexact numbers, characters, strings, symbols,
//! proper and dotted lists, and vectors. The reader works over a byte
//! slice and exposes its cursor, which lets the loader alternate between
//! textual datums and the raw instruction bytes that follow them.

use std::rc::Rc;

use num_bigint::BigInt;

use crate::error::{VmError, VmResult};
use crate::value::Value;

/// A cursor over the bytes of a bytecode container or constant source.
pub struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

fn is_delimiter(b: u8) -> bool {
    b.is_ascii_whitespace() || matches!(b, b'(' | b')' | b'"' | b';')
}

impl<'a> Reader<'a> {
    /// Creates a reader over `bytes`.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Current byte offset.
    pub fn pos(&self) -> usize {
        self.pos
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek();
        if b.is_some() {
            self.pos += 1;
        }
        b
    }

    /// Reads one raw byte, failing at end of input.
    pub fn read_raw_byte(&mut self) -> VmResult<u8> {
        self.bump()
            .ok_or_else(|| VmError::bad_bytecode("truncated bytecode file"))
    }

    /// Reads `count` raw bytes.
    pub fn read_raw_bytes(&mut self, count: usize) -> VmResult<&'a [u8]> {
        if self.pos + count > self.bytes.len() {
            return Err(VmError::bad_bytecode("truncated bytecode file"));
        }
        let slice = &self.bytes[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    fn skip_atmosphere(&mut self) {
        while let Some(b) = self.peek() {
            if b.is_ascii_whitespace() {
                self.pos += 1;
            } else if b == b';' {
                while let Some(c) = self.bump() {
                    if c == b'\n' {
                        break;
                    }
                }
            } else {
                break;
            }
        }
    }

    /// True when only atmosphere remains.
    pub fn at_eof(&mut self) -> bool {
        self.skip_atmosphere();
        self.pos >= self.bytes.len()
    }

    /// Reads the next datum, failing at end of input.
    pub fn read_datum(&mut self) -> VmResult<Value> {
        match self.try_read_datum()? {
            Some(v) => Ok(v),
            None => Err(VmError::bad_bytecode("unexpected end of input")),
        }
    }

    /// Reads the next datum, or `None` at end of input.
    pub fn try_read_datum(&mut self) -> VmResult<Option<Value>> {
        if self.at_eof() {
            return Ok(None);
        }
        self.parse_datum().map(Some)
    }

    fn parse_datum(&mut self) -> VmResult<Value> {
        self.skip_atmosphere();
        match self.peek() {
            None => Err(VmError::bad_bytecode("unexpected end of input")),
            Some(b'(') => {
                self.pos += 1;
                self.parse_list()
            }
            Some(b')') => Err(VmError::bad_bytecode("unexpected closing parenthesis")),
            Some(b'"') => {
                self.pos += 1;
                self.parse_string()
            }
            Some(b'#') => self.parse_sharp(),
            Some(b'\'') => {
                self.pos += 1;
                let quoted = self.parse_datum()?;
                Ok(Value::list(&[Value::symbol("quote"), quoted]))
            }
            Some(_) => self.parse_atom(),
        }
    }

    fn parse_list(&mut self) -> VmResult<Value> {
        let mut items = Vec::new();
        let mut tail = Value::Nil;
        loop {
            self.skip_atmosphere();
            match self.peek() {
                None => return Err(VmError::bad_bytecode("unterminated list")),
                Some(b')') => {
                    self.pos += 1;
                    break;
                }
                Some(b'.') if self.is_dot_at(self.pos) => {
                    self.pos += 1;
                    tail = self.parse_datum()?;
                    self.skip_atmosphere();
                    match self.bump() {
                        Some(b')') => break,
                        _ => return Err(VmError::bad_bytecode("malformed dotted list")),
                    }
                }
                Some(_) => items.push(self.parse_datum()?),
            }
        }
        let mut result = tail;
        for item in items.into_iter().rev() {
            result = Value::cons(item, result);
        }
        Ok(result)
    }

    /// A lone dot starts a dotted tail; `.5` or `.foo` does not.
    fn is_dot_at(&self, pos: usize) -> bool {
        self.bytes[pos] == b'.'
            && self
                .bytes
                .get(pos + 1)
                .map(|b| is_delimiter(*b))
                .unwrap_or(true)
    }

    fn parse_string(&mut self) -> VmResult<Value> {
        let mut text = String::new();
        loop {
            match self.bump() {
                None => return Err(VmError::bad_bytecode("unterminated string")),
                Some(b'"') => break,
                Some(b'\\') => match self.bump() {
                    Some(b'n') => text.push('\n'),
                    Some(b't') => text.push('\t'),
                    Some(b'r') => text.push('\r'),
                    Some(b'\\') => text.push('\\'),
                    Some(b'"') => text.push('"'),
                    Some(other) => text.push(other as char),
                    None => return Err(VmError::bad_bytecode("unterminated string escape")),
                },
                Some(b) => text.push(b as char),
            }
        }
        Ok(Value::string(text))
    }

    fn parse_sharp(&mut self) -> VmResult<Value> {
        // Consumes the '#'.
        self.pos += 1;
        match self.peek() {
            Some(b'(') => {
                self.pos += 1;
                let list = self.parse_list()?;
                Ok(Value::vector(list.list_to_vec().map_err(|_| {
                    VmError::bad_bytecode("dotted tail inside a vector literal")
                })?))
            }
            Some(b'\\') => {
                self.pos += 1;
                self.parse_char()
            }
            Some(_) => {
                let token = self.take_token();
                match token.as_str() {
                    "t" | "true" => Ok(Value::True),
                    "f" | "false" => Ok(Value::False),
                    "void" => Ok(Value::Void),
                    "eof" => Ok(Value::Eof),
                    other => Err(VmError::bad_bytecode(format!("unknown syntax #{other}"))),
                }
            }
            None => Err(VmError::bad_bytecode("unexpected end of input after #")),
        }
    }

    fn parse_char(&mut self) -> VmResult<Value> {
        let Some(first) = self.bump() else {
            return Err(VmError::bad_bytecode("unterminated character literal"));
        };
        // A named character continues with letters; a single character
        // stands for itself.
        if first.is_ascii_alphabetic()
            && self.peek().map(|b| !is_delimiter(b)).unwrap_or(false)
        {
            let mut name = String::new();
            name.push(first as char);
            while let Some(b) = self.peek() {
                if is_delimiter(b) {
                    break;
                }
                name.push(b as char);
                self.pos += 1;
            }
            match name.as_str() {
                "newline" => Ok(Value::Char('\n')),
                "space" => Ok(Value::Char(' ')),
                "tab" => Ok(Value::Char('\t')),
                other => Err(VmError::bad_bytecode(format!(
                    "unknown character name {other}"
                ))),
            }
        } else {
            Ok(Value::Char(first as char))
        }
    }

    fn take_token(&mut self) -> String {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if is_delimiter(b) {
                break;
            }
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned()
    }

    fn parse_atom(&mut self) -> VmResult<Value> {
        let token = self.take_token();
        if token.is_empty() {
            return Err(VmError::bad_bytecode("empty token"));
        }
        if let Some(v) = parse_number(&token) {
            return Ok(v);
        }
        Ok(Value::symbol(&token))
    }
}

/// Parses a numeric token: fixnum, bignum or flonum.
fn parse_number(token: &str) -> Option<Value> {
    let body = token.strip_prefix(['+', '-']).unwrap_or(token);
    if body.is_empty() {
        return None;
    }
    if body.chars().all(|c| c.is_ascii_digit()) {
        if let Ok(n) = token.parse::<i64>() {
            return Some(Value::Fixnum(n));
        }
        if let Some(n) = BigInt::parse_bytes(token.as_bytes(), 10) {
            return Some(Value::Bignum(Rc::new(n)));
        }
        return None;
    }
    if body.chars().next().is_some_and(|c| c.is_ascii_digit() || c == '.')
        && body.chars().all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'))
    {
        if let Ok(x) = token.parse::<f64>() {
            return Some(Value::Flonum(x));
        }
    }
    None
}
