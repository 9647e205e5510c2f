//! Expression parser.
//!
//! A hand written recursive descent parser for the field expression language.
//! Whitespace is insignificant outside quoted strings.
//!
//! | Family | Syntax |
//! |--------|--------|
//! | Registers | `hr:0#4`, `hr:0 .. hr:3`, `hr:0 - hr:3`, `hr:3, hr:2`, `"0x0102 0x0304"`, `swapbytes(..)`, `swapendian(..)` |
//! | Numbers | `int16`..`ieee754_64` `(registers ; 0xDEAD ; ...)`, literals, `+ - * / ^`, `5(3)`, field names |
//! | Strings | `'text'`, `utf8`, `hexstring`, `eui48`, `ipv4addr`, `ipv6addr`, `enum(.. ; 0->'Off')`, `concat`, `str(number)`, `boolean(b ; 'no' ; 'yes')` |
//! | String lists | `bitset(registers ; 0->'Alarm' ; ...)` |
//! | Booleans | `boolean(c:0)`, `bitsetbit(registers ; 4)`, `true`, `false` |
//!
//! Operator precedence is `^` (tightest), then `*` and `/` (and implicit
//! multiplication), then `+` and `-`; all operators are left associative.
//! Negation is only allowed directly on a literal, so `-5` and `2^-3` are
//! fine while `-(5)` is rejected.
//!
//! # Example
//!
//! ```
//! use modbus_schema::parse;
//!
//! let expr = parse("ieee754_32(ir:3 # 2) * 10 ^ scalingFactor")?;
//! assert_eq!(expr.to_string(), "ieee754_32(ir:00003 # 2)*(10^scalingFactor)");
//! assert!(parse("(5)3").is_err());
//! # Ok::<(), modbus_schema::ModbusError>(())
//! ```

use std::collections::BTreeMap;

use crate::address::Address;
use crate::error::{ModbusError, Result};
use crate::expression::{
    BinaryOp, BooleanExpr, Expression, FieldRef, NotImplemented, NumberExpr, NumericDecoder,
    ReferenceKind, RegistersExpr, StringExpr, StringListExpr,
};
use crate::utils::bytes_to_words;

/// Function names that can never be field names.
const KEYWORDS: [&str; 22] = [
    "int16",
    "int32",
    "int64",
    "uint16",
    "uint32",
    "uint64",
    "ieee754_32",
    "ieee754_64",
    "swapbytes",
    "swapendian",
    "utf8",
    "hexstring",
    "eui48",
    "ipv4addr",
    "ipv6addr",
    "enum",
    "concat",
    "str",
    "bitset",
    "bitsetbit",
    "boolean",
    "true",
];

const STRING_FUNCTIONS: [&str; 8] = [
    "utf8",
    "hexstring",
    "eui48",
    "ipv4addr",
    "ipv6addr",
    "enum",
    "concat",
    "str",
];

fn is_keyword(word: &str) -> bool {
    word == "false" || KEYWORDS.contains(&word)
}

/// Parses one field expression.
///
/// # Errors
///
/// Returns `ModbusError::Parse` naming the expression and the position of
/// the first token that does not fit the grammar. Defects that the grammar
/// allows (such as `int32` over 3 registers) are not errors; they are
/// reported by [`Expression::problems`].
///
/// # Example
///
/// ```
/// use modbus_schema::expression::{BinaryOp, Expression, NumberExpr};
/// use modbus_schema::parse;
///
/// let expr = parse("uint16(hr:100) + 5")?;
/// assert!(matches!(
///     expr,
///     Expression::Number(NumberExpr::Binary { op: BinaryOp::Add, .. })
/// ));
/// # Ok::<(), modbus_schema::ModbusError>(())
/// ```
pub fn parse(expression: &str) -> Result<Expression> {
    let mut parser = Parser::new(expression);
    let parsed = parser.expression()?;
    parser.skip_whitespace();
    if !parser.at_end() {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(parsed)
}

/// The things that may follow `;` inside a function call.
#[derive(Debug, Default)]
struct Tail {
    sentinels: Vec<Vec<u16>>,
    mappings: Vec<(i64, String)>,
    numbers: Vec<i64>,
}

/// The two shapes `boolean(...)` can take.
enum BooleanCall {
    Boolean(BooleanExpr),
    String(StringExpr),
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn error(&self, reason: &str) -> ModbusError {
        ModbusError::parse(self.text, format!("{reason} at position {}", self.pos))
    }

    fn bytes(&self) -> &'a [u8] {
        self.text.as_bytes()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn skip_whitespace(&mut self) {
        while self
            .bytes()
            .get(self.pos)
            .is_some_and(|byte| byte.is_ascii_whitespace())
        {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_whitespace();
        self.bytes().get(self.pos).copied()
    }

    fn peek_str(&mut self, prefix: &str) -> bool {
        self.skip_whitespace();
        self.text[self.pos..].starts_with(prefix)
    }

    fn eat(&mut self, expected: u8) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_str(&mut self, expected: &str) -> bool {
        if self.peek_str(expected) {
            self.pos += expected.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: u8) -> Result<()> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", char::from(expected))))
        }
    }

    fn scan_while(&self, start: usize, accept: impl Fn(u8) -> bool) -> usize {
        let mut end = start;
        while self.bytes().get(end).is_some_and(|byte| accept(*byte)) {
            end += 1;
        }
        end
    }

    /// The identifier at the current position, without consuming it.
    fn peek_word(&mut self) -> Option<&'a str> {
        self.skip_whitespace();
        let first = *self.bytes().get(self.pos)?;
        if !(first.is_ascii_alphabetic() || first == b'_') {
            return None;
        }
        let text = self.text;
        let end = self.scan_while(self.pos, |byte| byte.is_ascii_alphanumeric() || byte == b'_');
        Some(&text[self.pos..end])
    }

    /// `true` if the identifier at the current position is `word` followed by `(`.
    fn at_call(&mut self, word: &str) -> bool {
        if self.peek_word() != Some(word) {
            return false;
        }
        let after = self.pos + word.len();
        let next = self.scan_while(after, |byte| byte.is_ascii_whitespace());
        self.bytes().get(next) == Some(&b'(')
    }

    fn open_call(&mut self, word: &str) -> Result<()> {
        self.skip_whitespace();
        self.pos += word.len();
        self.expect(b'(')
    }

    fn field_name(&mut self) -> Result<&'a str> {
        let word = self
            .peek_word()
            .ok_or_else(|| self.error("expected a field name"))?;
        if is_keyword(word) {
            return Err(self.error(&format!("'{word}' is a function, not a field name")));
        }
        self.pos += word.len();
        Ok(word)
    }

    // ------------------------------------------------------------------
    // Top level

    fn expression(&mut self) -> Result<Expression> {
        if self.at_call("bitset") {
            return Ok(Expression::StringList(self.bitset()?));
        }
        if self.at_call("bitsetbit") || matches!(self.peek_word(), Some("true" | "false")) {
            return Ok(Expression::Boolean(self.boolean()?));
        }
        if self.at_call("boolean") {
            return Ok(match self.boolean_call()? {
                BooleanCall::Boolean(boolean) => Expression::Boolean(boolean),
                BooleanCall::String(string) => Expression::String(string),
            });
        }
        if self.peek() == Some(b'\'')
            || STRING_FUNCTIONS.iter().any(|function| self.at_call(function))
        {
            return Ok(Expression::String(self.string()?));
        }
        Ok(Expression::Number(self.sum()?))
    }

    // ------------------------------------------------------------------
    // Numbers

    fn sum(&mut self) -> Result<NumberExpr> {
        let mut left = self.product()?;
        loop {
            let op = if self.eat(b'+') {
                BinaryOp::Add
            } else if self.eat(b'-') {
                BinaryOp::Subtract
            } else {
                return Ok(left);
            };
            let right = self.product()?;
            left = NumberExpr::binary(op, left, right);
        }
    }

    fn product(&mut self) -> Result<NumberExpr> {
        let mut left = self.power()?;
        loop {
            let op = if self.eat(b'*') {
                BinaryOp::Multiply
            } else if self.eat(b'/') {
                BinaryOp::Divide
            } else if self.peek() == Some(b'(') {
                // `5(3)`
                BinaryOp::Multiply
            } else {
                return Ok(left);
            };
            let right = self.power()?;
            left = NumberExpr::binary(op, left, right);
        }
    }

    fn power(&mut self) -> Result<NumberExpr> {
        let mut base = self.unary()?;
        while self.eat(b'^') {
            let exponent = self.unary()?;
            base = NumberExpr::binary(BinaryOp::Power, base, exponent);
        }
        Ok(base)
    }

    fn unary(&mut self) -> Result<NumberExpr> {
        if self.eat(b'-') {
            if !self.peek().is_some_and(|byte| byte.is_ascii_digit()) {
                return Err(self.error("negation is only allowed on a number"));
            }
            return self.number_literal(true);
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<NumberExpr> {
        match self.peek() {
            Some(byte) if byte.is_ascii_digit() => self.number_literal(false),
            Some(b'(') => {
                self.pos += 1;
                let inner = self.sum()?;
                self.expect(b')')?;
                Ok(inner)
            }
            Some(_) => {
                if let Some(decoder) = self
                    .peek_word()
                    .and_then(NumericDecoder::from_name)
                    .filter(|decoder| self.at_call(decoder.name()))
                {
                    return self.loader(decoder);
                }
                let name = self.field_name()?;
                Ok(NumberExpr::Field(FieldRef::new(name, ReferenceKind::Number)))
            }
            None => Err(self.error("unexpected end of expression")),
        }
    }

    fn number_literal(&mut self, negative: bool) -> Result<NumberExpr> {
        self.skip_whitespace();
        let start = self.pos;
        let mut end = self.scan_while(start, |byte| byte.is_ascii_digit());
        let is_double = self.bytes().get(end) == Some(&b'.')
            && self.bytes().get(end + 1).is_some_and(u8::is_ascii_digit);
        if is_double {
            end = self.scan_while(end + 1, |byte| byte.is_ascii_digit());
        }
        let digits = &self.text[start..end];
        let literal = if negative {
            format!("-{digits}")
        } else {
            digits.to_string()
        };
        let parsed = if is_double {
            literal.parse::<f64>().ok().map(NumberExpr::Double)
        } else {
            literal.parse::<i64>().ok().map(NumberExpr::Long)
        };
        let number = parsed.ok_or_else(|| self.error(&format!("invalid number '{literal}'")))?;
        self.pos = end;
        Ok(number)
    }

    fn integer(&mut self) -> Result<i64> {
        let negative = self.eat(b'-');
        if !self.peek().is_some_and(|byte| byte.is_ascii_digit()) {
            return Err(self.error("expected an integer"));
        }
        match self.number_literal(negative)? {
            NumberExpr::Long(value) => Ok(value),
            _ => Err(self.error("expected an integer")),
        }
    }

    fn loader(&mut self, decoder: NumericDecoder) -> Result<NumberExpr> {
        self.open_call(decoder.name())?;
        let registers = self.registers()?;
        let tail = self.tail()?;
        let not_implemented = self.sentinels_only(tail)?;
        self.expect(b')')?;
        Ok(NumberExpr::decode(decoder, registers, not_implemented))
    }

    // ------------------------------------------------------------------
    // Registers

    fn registers(&mut self) -> Result<RegistersExpr> {
        if self.at_call("swapbytes") {
            self.open_call("swapbytes")?;
            let inner = self.registers()?;
            self.expect(b')')?;
            return Ok(RegistersExpr::SwapBytes(Box::new(inner)));
        }
        if self.at_call("swapendian") {
            self.open_call("swapendian")?;
            let inner = self.registers()?;
            self.expect(b')')?;
            return Ok(RegistersExpr::SwapEndian(Box::new(inner)));
        }
        if self.eat(b'"') {
            return self.register_constant();
        }

        let first = self.address()?;
        if self.eat(b'#') {
            let count = self.integer()?;
            if count <= 0 {
                return Err(self.error(&format!("invalid register count {count}")));
            }
            let count = u16::try_from(count)
                .map_err(|_| self.error(&format!("invalid register count {count}")))?;
            return Ok(RegistersExpr::Modbus(self.run(first, count)?));
        }
        if self.eat_str("..") || self.eat(b'-') {
            let last = self.address()?;
            let count = first
                .distance(last)
                .filter(|distance| *distance >= 0)
                .and_then(|distance| u16::try_from(distance + 1).ok())
                .ok_or_else(|| {
                    self.error(&format!("invalid register range {first} .. {last}"))
                })?;
            return Ok(RegistersExpr::Modbus(self.run(first, count)?));
        }
        let mut addresses = vec![first];
        while self.eat(b',') {
            addresses.push(self.address()?);
        }
        Ok(RegistersExpr::Modbus(addresses))
    }

    fn run(&self, first: Address, count: u16) -> Result<Vec<Address>> {
        (0..count)
            .map(|offset| {
                first
                    .increment(offset)
                    .map_err(|error| self.error(&error.to_string()))
            })
            .collect()
    }

    fn register_constant(&mut self) -> Result<RegistersExpr> {
        let start = self.pos;
        let end = self.scan_while(start, |byte| byte != b'"');
        if end >= self.text.len() {
            return Err(self.error("unterminated register constant"));
        }
        let words = hex_words(self.text[start..end].split_whitespace())
            .ok_or_else(|| self.error("register constants need whole registers of hex digits"))?;
        self.pos = end + 1;
        Ok(RegistersExpr::Constant(words))
    }

    /// `hr:123`, `holding-register:0x7B`, `4x00124`, `40124`, `0x123` ...
    fn address(&mut self) -> Result<Address> {
        self.skip_whitespace();
        let start = self.pos;
        let first = self
            .bytes()
            .get(start)
            .copied()
            .ok_or_else(|| self.error("expected an address"))?;
        let end = if first.is_ascii_alphabetic() {
            let label_end =
                self.scan_while(start, |byte| byte.is_ascii_alphabetic() || byte == b'-' || byte == b'_');
            if self.bytes().get(label_end) != Some(&b':') {
                return Err(self.error("expected an address"));
            }
            self.scan_while(label_end + 1, |byte| byte.is_ascii_alphanumeric())
        } else if first.is_ascii_digit() {
            self.scan_while(start, |byte| byte.is_ascii_alphanumeric())
        } else {
            return Err(self.error("expected an address"));
        };
        let text = &self.text[start..end];
        let address = Address::parse(text).map_err(|error| self.error(&error.to_string()))?;
        self.pos = end;
        Ok(address)
    }

    /// `true` if an address (rather than an identifier or a call) starts here.
    fn at_address(&mut self) -> bool {
        self.skip_whitespace();
        match self.bytes().get(self.pos) {
            Some(byte) if byte.is_ascii_digit() => true,
            Some(byte) if byte.is_ascii_alphabetic() => {
                let label_end = self
                    .scan_while(self.pos, |byte| byte.is_ascii_alphabetic() || byte == b'-' || byte == b'_');
                self.bytes().get(label_end) == Some(&b':')
            }
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // `; ...` arguments

    fn tail(&mut self) -> Result<Tail> {
        let mut tail = Tail::default();
        while self.eat(b';') {
            if self.peek_str("0x") || self.peek_str("0X") {
                tail.sentinels.push(self.sentinel()?);
                continue;
            }
            let number = self.integer()?;
            if self.eat_str("->") {
                let text = self.quoted()?;
                tail.mappings.push((number, text));
            } else {
                tail.numbers.push(number);
            }
        }
        Ok(tail)
    }

    fn sentinel(&mut self) -> Result<Vec<u16>> {
        let text = self.text;
        let mut words = Vec::new();
        while self.peek_str("0x") || self.peek_str("0X") {
            let start = self.pos;
            let end = self.scan_while(start + 2, |byte| byte.is_ascii_hexdigit());
            words.push(&text[start..end]);
            self.pos = end;
        }
        hex_words(words)
            .ok_or_else(|| self.error("a not implemented value needs whole registers of hex digits"))
    }

    fn sentinels_only(&self, tail: Tail) -> Result<NotImplemented> {
        if !tail.mappings.is_empty() || !tail.numbers.is_empty() {
            return Err(self.error("only not implemented values are allowed here"));
        }
        Ok(NotImplemented::new(tail.sentinels))
    }

    fn quoted(&mut self) -> Result<String> {
        if !self.eat(b'\'') {
            return Err(self.error("expected a quoted string"));
        }
        let start = self.pos;
        let end = self.scan_while(start, |byte| byte != b'\'');
        if end >= self.text.len() {
            return Err(self.error("unterminated string"));
        }
        self.pos = end + 1;
        Ok(self.text[start..end].to_string())
    }

    // ------------------------------------------------------------------
    // Strings

    fn string(&mut self) -> Result<StringExpr> {
        if self.at_call("concat") {
            self.open_call("concat")?;
            let mut parts = vec![self.fragment()?];
            while self.eat(b',') {
                parts.push(self.fragment()?);
            }
            self.expect(b')')?;
            return Ok(StringExpr::Concat(parts));
        }
        self.fragment()
    }

    fn fragment(&mut self) -> Result<StringExpr> {
        if self.peek() == Some(b'\'') {
            return Ok(StringExpr::Constant(self.quoted()?));
        }
        if self.at_call("utf8") {
            self.open_call("utf8")?;
            let registers = self.registers()?;
            self.expect(b')')?;
            return Ok(StringExpr::Utf8(registers));
        }
        if self.at_call("hexstring") {
            self.open_call("hexstring")?;
            let registers = self.registers()?;
            self.expect(b')')?;
            return Ok(StringExpr::Hex(registers));
        }
        for function in ["eui48", "ipv4addr", "ipv6addr"] {
            if self.at_call(function) {
                self.open_call(function)?;
                let registers = self.registers()?;
                let tail = self.tail()?;
                let not_implemented = self.sentinels_only(tail)?;
                self.expect(b')')?;
                return Ok(match function {
                    "eui48" => StringExpr::Eui48 {
                        registers,
                        not_implemented,
                    },
                    "ipv4addr" => StringExpr::Ipv4 {
                        registers,
                        not_implemented,
                    },
                    _ => StringExpr::Ipv6 {
                        registers,
                        not_implemented,
                    },
                });
            }
        }
        if self.at_call("enum") {
            return self.enumeration();
        }
        if self.at_call("str") {
            self.open_call("str")?;
            let number = self.sum()?;
            self.expect(b')')?;
            return Ok(StringExpr::FromNumber(Box::new(number)));
        }
        if self.at_call("boolean") {
            return match self.boolean_call()? {
                BooleanCall::String(string) => Ok(string),
                BooleanCall::Boolean(_) => Err(self.error(
                    "a boolean in a string needs the texts for false and true",
                )),
            };
        }
        let name = self.field_name()?;
        Ok(StringExpr::Field(FieldRef::new(name, ReferenceKind::String)))
    }

    fn enumeration(&mut self) -> Result<StringExpr> {
        self.open_call("enum")?;
        let registers = self.registers()?;
        let tail = self.tail()?;
        if !tail.numbers.is_empty() {
            return Err(self.error("enum values need a '->' mapping"));
        }
        self.expect(b')')?;
        Ok(StringExpr::Enum {
            registers,
            not_implemented: NotImplemented::new(tail.sentinels),
            mapping: tail.mappings.into_iter().collect(),
        })
    }

    fn bitset(&mut self) -> Result<StringListExpr> {
        self.open_call("bitset")?;
        let registers = self.registers()?;
        let tail = self.tail()?;
        if !tail.numbers.is_empty() {
            return Err(self.error("bitset bits need a '->' mapping"));
        }
        let mapping: BTreeMap<u32, String> = tail
            .mappings
            .into_iter()
            .map(|(bit, name)| {
                u32::try_from(bit)
                    .map(|bit| (bit, name))
                    .map_err(|_| self.error(&format!("invalid bit number {bit}")))
            })
            .collect::<Result<_>>()?;
        self.expect(b')')?;
        Ok(StringListExpr::Bitset {
            registers,
            not_implemented: NotImplemented::new(tail.sentinels),
            mapping,
        })
    }

    // ------------------------------------------------------------------
    // Booleans

    fn boolean(&mut self) -> Result<BooleanExpr> {
        match self.peek_word() {
            Some("true") => {
                self.pos += 4;
                return Ok(BooleanExpr::Constant(true));
            }
            Some("false") => {
                self.pos += 5;
                return Ok(BooleanExpr::Constant(false));
            }
            _ => {}
        }
        if self.at_call("bitsetbit") {
            return self.bitset_bit();
        }
        if self.at_call("boolean") {
            return match self.boolean_call()? {
                BooleanCall::Boolean(boolean) => Ok(boolean),
                BooleanCall::String(_) => Err(self.error("expected a boolean, not a string")),
            };
        }
        if self.at_address() {
            return Ok(BooleanExpr::Discrete(self.address()?));
        }
        let name = self.field_name()?;
        Ok(BooleanExpr::Field(FieldRef::new(name, ReferenceKind::Boolean)))
    }

    fn bitset_bit(&mut self) -> Result<BooleanExpr> {
        self.open_call("bitsetbit")?;
        let registers = self.registers()?;
        let tail = self.tail()?;
        if !tail.mappings.is_empty() || tail.numbers.len() != 1 {
            return Err(self.error("bitsetbit needs exactly one bit number"));
        }
        let bit = u32::try_from(tail.numbers[0])
            .map_err(|_| self.error(&format!("invalid bit number {}", tail.numbers[0])))?;
        self.expect(b')')?;
        Ok(BooleanExpr::BitsetBit {
            registers,
            not_implemented: NotImplemented::new(tail.sentinels),
            bit,
        })
    }

    /// `boolean(c:0)` is a discrete; `boolean(x ; 'no' ; 'yes')` is a string.
    fn boolean_call(&mut self) -> Result<BooleanCall> {
        self.open_call("boolean")?;
        let inner = self.boolean()?;
        if self.eat(b')') {
            return Ok(BooleanCall::Boolean(inner));
        }
        self.expect(b';')?;
        let zero = self.quoted()?;
        self.expect(b';')?;
        let one = self.quoted()?;
        self.expect(b')')?;
        Ok(BooleanCall::String(StringExpr::FromBoolean {
            boolean: Box::new(inner),
            zero,
            one,
        }))
    }
}

/// Decodes `0x0102 0x0304` style tokens into registers. Every token must
/// hold whole registers (a multiple of 4 hex digits); `None` otherwise.
fn hex_words<'a>(tokens: impl IntoIterator<Item = &'a str>) -> Option<Vec<u16>> {
    let mut words = Vec::new();
    for token in tokens {
        let digits = token
            .strip_prefix("0x")
            .or_else(|| token.strip_prefix("0X"))
            .unwrap_or(token);
        if digits.is_empty() || digits.len() % 4 != 0 {
            return None;
        }
        words.extend(bytes_to_words(&hex::decode(digits).ok()?));
    }
    (!words.is_empty()).then_some(words)
}
