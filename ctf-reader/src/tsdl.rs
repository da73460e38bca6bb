//! TSDL metadata parser
//!
//! Turns the metadata text produced by the framing reader into the
//! declaration tree the packet indexer and event reader decode against.
//! The grammar covered is the subset emitted by common tracers: `trace`,
//! `clock`, `stream`, `event`, `env` and `typealias` at the top level;
//! `integer`, `floating_point`, `string`, `struct`, `variant` and `enum`
//! type specifiers; fixed-length arrays and length-referenced sequences.
//! Anything outside the subset fails with `MetadataParse`.

use std::collections::HashMap;

use uuid::Uuid;

use crate::clock::ClockDecl;
use crate::decl::{
    ArrayDecl, ByteOrder, DeclArena, DeclId, Declaration, EnumDecl, EnumMapping, FloatDecl,
    IntegerDecl, SequenceDecl, StringDecl, StructDecl, StructFieldDecl, VariantDecl,
};
use crate::error::{CtfError, Result};

/// Declarations and trace facts extracted from one metadata document
#[derive(Debug)]
pub struct ParsedMetadata {
    pub arena: DeclArena,
    pub byte_order: ByteOrder,
    pub uuid: Option<Uuid>,
    pub major: Option<u64>,
    pub minor: Option<u64>,
    pub packet_header: Option<DeclId>,
    pub streams: Vec<StreamSpec>,
    pub events: Vec<EventSpec>,
    pub clock: Option<ClockDecl>,
    pub env: Vec<(String, String)>,
}

/// One `stream` block
#[derive(Debug)]
pub struct StreamSpec {
    pub id: u64,
    pub packet_context: Option<DeclId>,
    pub event_header: Option<DeclId>,
    pub event_context: Option<DeclId>,
}

/// One `event` block
#[derive(Debug)]
pub struct EventSpec {
    pub name: Option<String>,
    pub id: u64,
    pub stream_id: u64,
    pub context: Option<DeclId>,
    pub fields: Option<DeclId>,
}

/// Parse metadata text. `framing_order` is the byte order fixed by a
/// binary metadata framing; a `byte_order` attribute that contradicts it
/// is an error, since the trace byte order is immutable once set.
pub fn parse(text: &str, framing_order: Option<ByteOrder>) -> Result<ParsedMetadata> {
    let tokens = lex(text)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        arena: DeclArena::new(),
        aliases: HashMap::new(),
        struct_aliases: HashMap::new(),
        byte_order: framing_order.unwrap_or_else(ByteOrder::native),
        byte_order_fixed: framing_order.is_some(),
        uuid: None,
        major: None,
        minor: None,
        packet_header: None,
        streams: Vec::new(),
        events: Vec::new(),
        clock: None,
        env: Vec::new(),
    };
    parser.parse_document()?;
    Ok(ParsedMetadata {
        arena: parser.arena,
        byte_order: parser.byte_order,
        uuid: parser.uuid,
        major: parser.major,
        minor: parser.minor,
        packet_header: parser.packet_header,
        streams: parser.streams,
        events: parser.events,
        clock: parser.clock,
        env: parser.env,
    })
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(u64),
    Str(String),
    LBrace,
    RBrace,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Lt,
    Gt,
    Semi,
    Colon,
    ColonEq,
    Comma,
    Eq,
    Dot,
    Ellipsis,
    Minus,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "identifier {s:?}"),
            Token::Int(v) => write!(f, "integer {v}"),
            Token::Str(s) => write!(f, "string {s:?}"),
            Token::LBrace => write!(f, "'{{'"),
            Token::RBrace => write!(f, "'}}'"),
            Token::LParen => write!(f, "'('"),
            Token::RParen => write!(f, "')'"),
            Token::LBracket => write!(f, "'['"),
            Token::RBracket => write!(f, "']'"),
            Token::Lt => write!(f, "'<'"),
            Token::Gt => write!(f, "'>'"),
            Token::Semi => write!(f, "';'"),
            Token::Colon => write!(f, "':'"),
            Token::ColonEq => write!(f, "':='"),
            Token::Comma => write!(f, "','"),
            Token::Eq => write!(f, "'='"),
            Token::Dot => write!(f, "'.'"),
            Token::Ellipsis => write!(f, "'...'"),
            Token::Minus => write!(f, "'-'"),
        }
    }
}

struct Located {
    token: Token,
    line: u32,
}

fn lex(text: &str) -> Result<Vec<Located>> {
    let bytes = text.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    let mut line = 1u32;

    let err = |line: u32, msg: &str| CtfError::metadata(format!("line {line}: {msg}"));

    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b'\n' => {
                line += 1;
                i += 1;
            }
            b' ' | b'\t' | b'\r' => i += 1,
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                loop {
                    match bytes.get(i) {
                        None => return Err(err(line, "unterminated comment")),
                        Some(b'\n') => line += 1,
                        Some(b'*') if bytes.get(i + 1) == Some(&b'/') => {
                            i += 2;
                            break;
                        }
                        Some(_) => {}
                    }
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'"' => {
                i += 1;
                let mut s = String::new();
                loop {
                    match bytes.get(i) {
                        None | Some(b'\n') => return Err(err(line, "unterminated string")),
                        Some(b'"') => {
                            i += 1;
                            break;
                        }
                        Some(b'\\') => {
                            match bytes.get(i + 1) {
                                Some(b'n') => s.push('\n'),
                                Some(b't') => s.push('\t'),
                                Some(&q) => s.push(q as char),
                                None => return Err(err(line, "unterminated string")),
                            }
                            i += 2;
                        }
                        Some(&b) => {
                            s.push(b as char);
                            i += 1;
                        }
                    }
                }
                tokens.push(Located {
                    token: Token::Str(s),
                    line,
                });
            }
            b'0'..=b'9' => {
                let start = i;
                let value = if c == b'0' && matches!(bytes.get(i + 1), Some(b'x') | Some(b'X')) {
                    i += 2;
                    let hex_start = i;
                    while i < bytes.len() && bytes[i].is_ascii_hexdigit() {
                        i += 1;
                    }
                    u64::from_str_radix(&text[hex_start..i], 16)
                        .map_err(|_| err(line, "invalid hexadecimal literal"))?
                } else {
                    while i < bytes.len() && bytes[i].is_ascii_digit() {
                        i += 1;
                    }
                    let digits = &text[start..i];
                    if digits.len() > 1 && digits.starts_with('0') {
                        u64::from_str_radix(&digits[1..], 8)
                            .map_err(|_| err(line, "invalid octal literal"))?
                    } else {
                        digits
                            .parse()
                            .map_err(|_| err(line, "invalid integer literal"))?
                    }
                };
                tokens.push(Located {
                    token: Token::Int(value),
                    line,
                });
            }
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                tokens.push(Located {
                    token: Token::Ident(text[start..i].to_owned()),
                    line,
                });
            }
            b':' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Located {
                    token: Token::ColonEq,
                    line,
                });
                i += 2;
            }
            b'.' if bytes.get(i + 1) == Some(&b'.') && bytes.get(i + 2) == Some(&b'.') => {
                tokens.push(Located {
                    token: Token::Ellipsis,
                    line,
                });
                i += 3;
            }
            _ => {
                let token = match c {
                    b'{' => Token::LBrace,
                    b'}' => Token::RBrace,
                    b'(' => Token::LParen,
                    b')' => Token::RParen,
                    b'[' => Token::LBracket,
                    b']' => Token::RBracket,
                    b'<' => Token::Lt,
                    b'>' => Token::Gt,
                    b';' => Token::Semi,
                    b':' => Token::Colon,
                    b',' => Token::Comma,
                    b'=' => Token::Eq,
                    b'.' => Token::Dot,
                    b'-' => Token::Minus,
                    other => {
                        return Err(err(
                            line,
                            &format!("unexpected character {:?}", other as char),
                        ))
                    }
                };
                tokens.push(Located { token, line });
                i += 1;
            }
        }
    }
    Ok(tokens)
}

/// Scalar attribute value
#[derive(Debug, Clone, PartialEq)]
enum AttrValue {
    Int(i64),
    Str(String),
    Ident(String),
}

impl AttrValue {
    fn as_u64(&self, what: &str) -> Result<u64> {
        match self {
            AttrValue::Int(v) if *v >= 0 => Ok(*v as u64),
            _ => Err(CtfError::metadata(format!(
                "{what} expects a non-negative integer, got {self:?}"
            ))),
        }
    }

    fn as_i64(&self, what: &str) -> Result<i64> {
        match self {
            AttrValue::Int(v) => Ok(*v),
            _ => Err(CtfError::metadata(format!(
                "{what} expects an integer, got {self:?}"
            ))),
        }
    }

    fn as_text(&self) -> String {
        match self {
            AttrValue::Int(v) => v.to_string(),
            AttrValue::Str(s) | AttrValue::Ident(s) => s.clone(),
        }
    }
}

struct Parser {
    tokens: Vec<Located>,
    pos: usize,
    arena: DeclArena,
    aliases: HashMap<String, DeclId>,
    struct_aliases: HashMap<String, DeclId>,
    byte_order: ByteOrder,
    byte_order_fixed: bool,
    uuid: Option<Uuid>,
    major: Option<u64>,
    minor: Option<u64>,
    packet_header: Option<DeclId>,
    streams: Vec<StreamSpec>,
    events: Vec<EventSpec>,
    clock: Option<ClockDecl>,
    env: Vec<(String, String)>,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|t| &t.token)
    }

    fn line(&self) -> u32 {
        self.tokens
            .get(self.pos.min(self.tokens.len().saturating_sub(1)))
            .map(|t| t.line)
            .unwrap_or(0)
    }

    fn next(&mut self) -> Result<Token> {
        let t = self
            .tokens
            .get(self.pos)
            .ok_or_else(|| CtfError::metadata("unexpected end of metadata"))?;
        self.pos += 1;
        Ok(t.token.clone())
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        let line = self.line();
        let t = self.next()?;
        if t != expected {
            return Err(CtfError::metadata(format!(
                "line {line}: expected {expected}, got {t}"
            )));
        }
        Ok(())
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn ident(&mut self) -> Result<String> {
        let line = self.line();
        match self.next()? {
            Token::Ident(s) => Ok(s),
            t => Err(CtfError::metadata(format!(
                "line {line}: expected identifier, got {t}"
            ))),
        }
    }

    /// `a` or `a.b.c`, joined with dots
    fn scoped_name(&mut self) -> Result<String> {
        let mut name = self.ident()?;
        while self.eat(&Token::Dot) {
            name.push('.');
            name.push_str(&self.ident()?);
        }
        Ok(name)
    }

    fn attr_value(&mut self) -> Result<AttrValue> {
        let line = self.line();
        match self.next()? {
            Token::Int(v) => Ok(AttrValue::Int(v as i64)),
            Token::Minus => match self.next()? {
                Token::Int(v) => Ok(AttrValue::Int(-(v as i64))),
                t => Err(CtfError::metadata(format!(
                    "line {line}: expected integer after '-', got {t}"
                ))),
            },
            Token::Str(s) => Ok(AttrValue::Str(s)),
            Token::Ident(s) => {
                // Dotted identifier values (clock references)
                let mut s = s;
                while self.eat(&Token::Dot) {
                    s.push('.');
                    s.push_str(&self.ident()?);
                }
                Ok(AttrValue::Ident(s))
            }
            t => Err(CtfError::metadata(format!(
                "line {line}: expected attribute value, got {t}"
            ))),
        }
    }

    fn parse_document(&mut self) -> Result<()> {
        while self.peek().is_some() {
            let line = self.line();
            let block = self.ident()?;
            match block.as_str() {
                "trace" => self.parse_trace_block()?,
                "stream" => self.parse_stream_block()?,
                "event" => self.parse_event_block()?,
                "clock" => self.parse_clock_block()?,
                "env" => self.parse_env_block()?,
                "typealias" => self.parse_typealias()?,
                other => {
                    return Err(CtfError::metadata(format!(
                        "line {line}: unsupported top-level block {other:?}"
                    )))
                }
            }
        }
        Ok(())
    }

    fn set_byte_order(&mut self, value: &str, line: u32) -> Result<()> {
        let order = match value {
            "le" => ByteOrder::Little,
            "be" | "network" => ByteOrder::Big,
            "native" => self.byte_order,
            other => {
                return Err(CtfError::metadata(format!(
                    "line {line}: unknown byte order {other:?}"
                )))
            }
        };
        if self.byte_order_fixed && order != self.byte_order {
            return Err(CtfError::metadata(format!(
                "line {line}: trace byte order {order} contradicts the metadata packet framing"
            )));
        }
        self.byte_order = order;
        self.byte_order_fixed = true;
        Ok(())
    }

    fn parse_trace_block(&mut self) -> Result<()> {
        self.expect(Token::LBrace)?;
        while !self.eat(&Token::RBrace) {
            let line = self.line();
            let name = self.scoped_name()?;
            if self.eat(&Token::ColonEq) {
                let decl = self.parse_type_spec()?;
                match name.as_str() {
                    "packet.header" => self.packet_header = Some(decl),
                    other => {
                        return Err(CtfError::metadata(format!(
                            "line {line}: unsupported trace scope {other:?}"
                        )))
                    }
                }
            } else {
                self.expect(Token::Eq)?;
                let value = self.attr_value()?;
                match name.as_str() {
                    "major" => self.major = Some(value.as_u64("major")?),
                    "minor" => self.minor = Some(value.as_u64("minor")?),
                    "uuid" => {
                        let text = value.as_text();
                        let uuid = Uuid::parse_str(&text).map_err(|e| {
                            CtfError::metadata(format!("line {line}: invalid trace uuid: {e}"))
                        })?;
                        self.uuid = Some(uuid);
                    }
                    "byte_order" => self.set_byte_order(&value.as_text(), line)?,
                    // Tolerated but unused trace attributes
                    _ => tracing::debug!(attr = %name, "ignoring trace attribute"),
                }
            }
            self.expect(Token::Semi)?;
        }
        self.eat(&Token::Semi);
        Ok(())
    }

    fn parse_stream_block(&mut self) -> Result<()> {
        self.expect(Token::LBrace)?;
        let mut spec = StreamSpec {
            id: 0,
            packet_context: None,
            event_header: None,
            event_context: None,
        };
        while !self.eat(&Token::RBrace) {
            let line = self.line();
            let name = self.scoped_name()?;
            if self.eat(&Token::ColonEq) {
                let decl = self.parse_type_spec()?;
                match name.as_str() {
                    "packet.context" => spec.packet_context = Some(decl),
                    "event.header" => spec.event_header = Some(decl),
                    "event.context" => spec.event_context = Some(decl),
                    other => {
                        return Err(CtfError::metadata(format!(
                            "line {line}: unsupported stream scope {other:?}"
                        )))
                    }
                }
            } else {
                self.expect(Token::Eq)?;
                let value = self.attr_value()?;
                match name.as_str() {
                    "id" => spec.id = value.as_u64("stream id")?,
                    _ => tracing::debug!(attr = %name, "ignoring stream attribute"),
                }
            }
            self.expect(Token::Semi)?;
        }
        self.eat(&Token::Semi);
        self.streams.push(spec);
        Ok(())
    }

    fn parse_event_block(&mut self) -> Result<()> {
        self.expect(Token::LBrace)?;
        let mut spec = EventSpec {
            name: None,
            id: 0,
            stream_id: 0,
            context: None,
            fields: None,
        };
        while !self.eat(&Token::RBrace) {
            let line = self.line();
            let name = self.scoped_name()?;
            if self.eat(&Token::ColonEq) {
                let decl = self.parse_type_spec()?;
                match name.as_str() {
                    "context" => spec.context = Some(decl),
                    "fields" => spec.fields = Some(decl),
                    other => {
                        return Err(CtfError::metadata(format!(
                            "line {line}: unsupported event scope {other:?}"
                        )))
                    }
                }
            } else {
                self.expect(Token::Eq)?;
                let value = self.attr_value()?;
                match name.as_str() {
                    "name" => spec.name = Some(value.as_text()),
                    "id" => spec.id = value.as_u64("event id")?,
                    "stream_id" => spec.stream_id = value.as_u64("event stream_id")?,
                    _ => tracing::debug!(attr = %name, "ignoring event attribute"),
                }
            }
            self.expect(Token::Semi)?;
        }
        self.eat(&Token::Semi);
        self.events.push(spec);
        Ok(())
    }

    fn parse_clock_block(&mut self) -> Result<()> {
        self.expect(Token::LBrace)?;
        let mut clock = ClockDecl::default();
        while !self.eat(&Token::RBrace) {
            let line = self.line();
            let name = self.ident()?;
            self.expect(Token::Eq)?;
            let value = self.attr_value()?;
            match name.as_str() {
                "name" => clock.name = value.as_text(),
                "uuid" => {
                    let text = value.as_text();
                    clock.uuid = Some(Uuid::parse_str(&text).map_err(|e| {
                        CtfError::metadata(format!("line {line}: invalid clock uuid: {e}"))
                    })?);
                }
                "description" => clock.description = Some(value.as_text()),
                "freq" => clock.freq = value.as_u64("clock freq")?,
                "precision" => clock.precision = value.as_u64("clock precision")?,
                "offset_s" => clock.offset_s = value.as_i64("clock offset_s")?,
                "offset" => clock.offset = value.as_i64("clock offset")?,
                "absolute" => {
                    clock.absolute =
                        matches!(value.as_text().as_str(), "TRUE" | "true" | "1");
                }
                _ => tracing::debug!(attr = %name, "ignoring clock attribute"),
            }
            self.expect(Token::Semi)?;
        }
        self.eat(&Token::Semi);
        self.clock = Some(clock);
        Ok(())
    }

    fn parse_env_block(&mut self) -> Result<()> {
        self.expect(Token::LBrace)?;
        while !self.eat(&Token::RBrace) {
            let name = self.ident()?;
            self.expect(Token::Eq)?;
            let value = self.attr_value()?;
            self.expect(Token::Semi)?;
            self.env.push((name, value.as_text()));
        }
        self.eat(&Token::Semi);
        Ok(())
    }

    fn parse_typealias(&mut self) -> Result<()> {
        let decl = self.parse_type_spec()?;
        self.expect(Token::ColonEq)?;
        // Alias names may span several words (`unsigned long`).
        let mut name = self.ident()?;
        while let Some(Token::Ident(_)) = self.peek() {
            name.push(' ');
            name.push_str(&self.ident()?);
        }
        self.expect(Token::Semi)?;
        self.aliases.insert(name, decl);
        Ok(())
    }

    fn parse_type_spec(&mut self) -> Result<DeclId> {
        let line = self.line();
        let keyword = self.ident()?;
        match keyword.as_str() {
            "integer" => {
                let decl = self.parse_integer_body()?;
                Ok(self.arena.alloc(Declaration::Integer(decl)))
            }
            "floating_point" => self.parse_float_body(),
            "string" => {
                if self.eat(&Token::LBrace) {
                    // encoding attribute only; accepted and ignored
                    while !self.eat(&Token::RBrace) {
                        self.ident()?;
                        self.expect(Token::Eq)?;
                        self.attr_value()?;
                        self.expect(Token::Semi)?;
                    }
                }
                Ok(self.arena.alloc(Declaration::String(StringDecl)))
            }
            "struct" => self.parse_struct_spec(),
            "variant" => self.parse_variant_spec(),
            "enum" => self.parse_enum_spec(),
            name => self
                .aliases
                .get(name)
                .copied()
                .ok_or_else(|| {
                    CtfError::metadata(format!("line {line}: unknown type {name:?}"))
                }),
        }
    }

    fn parse_integer_body(&mut self) -> Result<IntegerDecl> {
        let open_line = self.line();
        self.expect(Token::LBrace)?;
        let mut size = None;
        let mut align = None;
        let mut signed = false;
        let mut byte_order = self.byte_order;
        let mut base = 10;
        while !self.eat(&Token::RBrace) {
            let line = self.line();
            let name = self.ident()?;
            self.expect(Token::Eq)?;
            let value = self.attr_value()?;
            match name.as_str() {
                "size" => size = Some(value.as_u64("integer size")? as u32),
                "align" => align = Some(value.as_u64("integer align")?),
                "signed" => {
                    signed = matches!(value.as_text().as_str(), "true" | "TRUE" | "1");
                }
                "byte_order" => {
                    byte_order = match value.as_text().as_str() {
                        "le" => ByteOrder::Little,
                        "be" | "network" => ByteOrder::Big,
                        "native" => self.byte_order,
                        other => {
                            return Err(CtfError::metadata(format!(
                                "line {line}: unknown byte order {other:?}"
                            )))
                        }
                    };
                }
                "base" => base = parse_base(&value, line)?,
                // encoding and clock maps do not affect decoding
                "encoding" | "map" => {}
                other => {
                    return Err(CtfError::metadata(format!(
                        "line {line}: unknown integer attribute {other:?}"
                    )))
                }
            }
            self.expect(Token::Semi)?;
        }
        let len = size.ok_or_else(|| {
            CtfError::metadata(format!("line {open_line}: integer without a size"))
        })?;
        if len == 0 || len > 64 {
            return Err(CtfError::metadata(format!(
                "line {open_line}: unsupported integer size {len}"
            )));
        }
        Ok(IntegerDecl {
            len,
            signed,
            byte_order,
            base,
            align: align.unwrap_or_else(|| IntegerDecl::default_align(len)),
        })
    }

    fn parse_float_body(&mut self) -> Result<DeclId> {
        let open_line = self.line();
        self.expect(Token::LBrace)?;
        let mut exp_dig = None;
        let mut mant_dig = None;
        let mut align = 8;
        let mut byte_order = self.byte_order;
        while !self.eat(&Token::RBrace) {
            let line = self.line();
            let name = self.ident()?;
            self.expect(Token::Eq)?;
            let value = self.attr_value()?;
            match name.as_str() {
                "exp_dig" => exp_dig = Some(value.as_u64("exp_dig")? as u32),
                "mant_dig" => mant_dig = Some(value.as_u64("mant_dig")? as u32),
                "align" => align = value.as_u64("float align")?,
                "byte_order" => {
                    byte_order = match value.as_text().as_str() {
                        "le" => ByteOrder::Little,
                        "be" | "network" => ByteOrder::Big,
                        "native" => self.byte_order,
                        other => {
                            return Err(CtfError::metadata(format!(
                                "line {line}: unknown byte order {other:?}"
                            )))
                        }
                    };
                }
                other => {
                    return Err(CtfError::metadata(format!(
                        "line {line}: unknown floating_point attribute {other:?}"
                    )))
                }
            }
            self.expect(Token::Semi)?;
        }
        let exp_dig = exp_dig.ok_or_else(|| {
            CtfError::metadata(format!("line {open_line}: floating_point without exp_dig"))
        })?;
        let mant_dig = mant_dig.ok_or_else(|| {
            CtfError::metadata(format!("line {open_line}: floating_point without mant_dig"))
        })?;
        Ok(self.arena.alloc(Declaration::Float(FloatDecl {
            exp_dig,
            mant_dig,
            byte_order,
            align,
        })))
    }

    fn parse_struct_spec(&mut self) -> Result<DeclId> {
        let line = self.line();
        // Optional struct name: a definition when a body follows, a
        // reference to an earlier definition otherwise.
        let name = match self.peek() {
            Some(Token::Ident(_)) => Some(self.ident()?),
            _ => None,
        };
        if self.peek() != Some(&Token::LBrace) {
            let name = name.ok_or_else(|| {
                CtfError::metadata(format!("line {line}: anonymous struct without a body"))
            })?;
            return self.struct_aliases.get(&name).copied().ok_or_else(|| {
                CtfError::metadata(format!("line {line}: unknown struct {name:?}"))
            });
        }
        self.expect(Token::LBrace)?;
        let mut fields = Vec::new();
        while !self.eat(&Token::RBrace) {
            let field = self.parse_field()?;
            fields.push(field);
        }
        let mut min_align = 1;
        if self.peek() == Some(&Token::Ident("align".to_owned())) {
            self.ident()?;
            self.expect(Token::LParen)?;
            let line = self.line();
            match self.next()? {
                Token::Int(v) => min_align = v,
                t => {
                    return Err(CtfError::metadata(format!(
                        "line {line}: expected alignment, got {t}"
                    )))
                }
            }
            self.expect(Token::RParen)?;
        }
        let align = self.arena.struct_align(&fields, min_align);
        let id = self
            .arena
            .alloc(Declaration::Struct(StructDecl { fields, align }));
        if let Some(name) = name {
            self.struct_aliases.insert(name, id);
        }
        Ok(id)
    }

    fn parse_variant_spec(&mut self) -> Result<DeclId> {
        self.expect(Token::Lt)?;
        let tag = self.scoped_name()?;
        self.expect(Token::Gt)?;
        self.expect(Token::LBrace)?;
        let mut arms = Vec::new();
        while !self.eat(&Token::RBrace) {
            let arm = self.parse_field()?;
            arms.push(arm);
        }
        Ok(self
            .arena
            .alloc(Declaration::Variant(VariantDecl { tag, arms })))
    }

    fn parse_enum_spec(&mut self) -> Result<DeclId> {
        let line = self.line();
        self.expect(Token::Colon)?;
        let container_id = self.parse_type_spec()?;
        let container = match self.arena.get(container_id) {
            Declaration::Integer(i) => i.clone(),
            _ => {
                return Err(CtfError::metadata(format!(
                    "line {line}: enum container is not an integer"
                )))
            }
        };
        self.expect(Token::LBrace)?;
        let mut mappings = Vec::new();
        let mut next_value = 0i64;
        loop {
            if self.eat(&Token::RBrace) {
                break;
            }
            let line = self.line();
            let label = match self.next()? {
                Token::Ident(s) | Token::Str(s) => s,
                t => {
                    return Err(CtfError::metadata(format!(
                        "line {line}: expected enum label, got {t}"
                    )))
                }
            };
            let (start, end) = if self.eat(&Token::Eq) {
                let start = self.signed_int()?;
                let end = if self.eat(&Token::Ellipsis) {
                    self.signed_int()?
                } else {
                    start
                };
                (start, end)
            } else {
                (next_value, next_value)
            };
            next_value = end + 1;
            mappings.push(EnumMapping { label, start, end });
            if !self.eat(&Token::Comma) {
                self.expect(Token::RBrace)?;
                break;
            }
        }
        Ok(self.arena.alloc(Declaration::Enum(EnumDecl {
            container,
            mappings,
        })))
    }

    fn signed_int(&mut self) -> Result<i64> {
        let line = self.line();
        match self.next()? {
            Token::Int(v) => Ok(v as i64),
            Token::Minus => match self.next()? {
                Token::Int(v) => Ok(-(v as i64)),
                t => Err(CtfError::metadata(format!(
                    "line {line}: expected integer after '-', got {t}"
                ))),
            },
            t => Err(CtfError::metadata(format!(
                "line {line}: expected integer, got {t}"
            ))),
        }
    }

    /// `type_spec name;` with optional `[len]` or `[length_field]` suffix
    fn parse_field(&mut self) -> Result<StructFieldDecl> {
        let decl = self.parse_type_spec()?;
        let name = self.ident()?;
        let decl = if self.eat(&Token::LBracket) {
            let line = self.line();
            let wrapped = match self.next()? {
                Token::Int(len) => self
                    .arena
                    .alloc(Declaration::Array(ArrayDecl { len, elem: decl })),
                Token::Ident(first) => {
                    let mut length_field = first;
                    while self.eat(&Token::Dot) {
                        length_field.push('.');
                        length_field.push_str(&self.ident()?);
                    }
                    self.arena.alloc(Declaration::Sequence(SequenceDecl {
                        length_field,
                        elem: decl,
                    }))
                }
                t => {
                    return Err(CtfError::metadata(format!(
                        "line {line}: expected array length, got {t}"
                    )))
                }
            };
            self.expect(Token::RBracket)?;
            wrapped
        } else {
            decl
        };
        self.expect(Token::Semi)?;
        Ok(StructFieldDecl { name, decl })
    }
}

fn parse_base(value: &AttrValue, line: u32) -> Result<u32> {
    let base = match value {
        AttrValue::Int(10) => 10,
        AttrValue::Int(16) => 16,
        AttrValue::Int(8) => 8,
        AttrValue::Int(2) => 2,
        AttrValue::Ident(s) => match s.as_str() {
            "decimal" | "dec" | "d" | "i" | "u" => 10,
            "hexadecimal" | "hex" | "x" | "X" | "p" => 16,
            "octal" | "oct" | "o" => 8,
            "binary" | "b" => 2,
            other => {
                return Err(CtfError::metadata(format!(
                    "line {line}: unknown integer base {other:?}"
                )))
            }
        },
        other => {
            return Err(CtfError::metadata(format!(
                "line {line}: unknown integer base {other:?}"
            )))
        }
    };
    Ok(base)
}
