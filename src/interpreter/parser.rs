use super::ast::{
    AclDecl, AclLine, AssignOp, BinaryOp, Declaration, Expr, FieldAssign, FieldValue, Literal,
    LiteralKind, ObjectDecl, ReturnValue, SourceUnit, Statement, SubDecl, UnaryOp,
};
use super::{CompileError, Result};

/// Parse policy source text into a [`SourceUnit`].
pub fn parse_source(name: &str, source: &str) -> Result<SourceUnit> {
    let tokens = Lexer::new(name, source).tokenize()?;
    let mut parser = Parser {
        unit: name,
        tokens,
        index: 0,
    };
    let mut declarations = Vec::new();
    while !parser.at_eof() {
        if let Some(decl) = parser.parse_declaration()? {
            declarations.push(decl);
        }
    }
    Ok(SourceUnit {
        name: name.to_string(),
        declarations,
    })
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    Literal(Literal),
    Punct(&'static str),
    Eof,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    line: usize,
    column: usize,
}

const PUNCTUATION: &[&str] = &[
    "||", "&&", "==", "!=", "!~", "<=", ">=", "+=", "-=", "*=", "/=", "{", "}", "(", ")", ";",
    ",", ".", "<", ">", "~", "!", "|", "^", "&", "+", "-", "*", "/", "%", "?", ":", "=",
];

const DURATION_UNITS: &[&str] = &["ms", "s", "m", "h", "d", "w", "y"];

struct Lexer<'a> {
    unit: &'a str,
    src: &'a str,
    bytes: &'a [u8],
    index: usize,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    fn new(unit: &'a str, src: &'a str) -> Self {
        Self {
            unit,
            src,
            bytes: src.as_bytes(),
            index: 0,
            line: 1,
            column: 1,
        }
    }

    fn current(&self) -> Option<u8> {
        self.bytes.get(self.index).copied()
    }

    fn peek(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.index + offset).copied()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.current() {
            self.index += 1;
            if ch == b'\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError::Syntax {
            unit: self.unit.to_string(),
            message: message.into(),
            line: self.line,
            column: self.column,
        }
    }

    fn skip_trivia(&mut self) -> Result<()> {
        loop {
            match (self.current(), self.peek(1)) {
                (Some(ch), _) if ch.is_ascii_whitespace() => self.advance(),
                (Some(b'#'), _) | (Some(b'/'), Some(b'/')) => {
                    while let Some(ch) = self.current() {
                        if ch == b'\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                (Some(b'/'), Some(b'*')) => {
                    self.advance();
                    self.advance();
                    loop {
                        match (self.current(), self.peek(1)) {
                            (Some(b'*'), Some(b'/')) => {
                                self.advance();
                                self.advance();
                                break;
                            }
                            (Some(_), _) => self.advance(),
                            (None, _) => return Err(self.error("unterminated comment")),
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn tokenize(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia()?;
            let (line, column) = (self.line, self.column);
            let Some(ch) = self.current() else {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    line,
                    column,
                });
                return Ok(tokens);
            };
            let kind = match ch {
                b'"' => self.lex_string()?,
                b'{' if self.peek(1) == Some(b'"') => self.lex_synthetic()?,
                b'0'..=b'9' => self.lex_number()?,
                c if c.is_ascii_alphabetic() || c == b'_' => self.lex_ident(),
                _ => self.lex_punct()?,
            };
            tokens.push(Token { kind, line, column });
        }
    }

    fn lex_string(&mut self) -> Result<TokenKind> {
        let start = self.index;
        self.advance();
        loop {
            match self.current() {
                Some(b'"') => {
                    self.advance();
                    break;
                }
                Some(b'\n') | None => return Err(self.error("unterminated string literal")),
                Some(_) => self.advance(),
            }
        }
        Ok(TokenKind::Literal(Literal::new(
            LiteralKind::String,
            &self.src[start..self.index],
        )))
    }

    fn lex_synthetic(&mut self) -> Result<TokenKind> {
        let start = self.index;
        self.advance();
        self.advance();
        loop {
            match (self.current(), self.peek(1)) {
                (Some(b'"'), Some(b'}')) => {
                    self.advance();
                    self.advance();
                    break;
                }
                (Some(_), _) => self.advance(),
                (None, _) => return Err(self.error("unterminated synthetic string")),
            }
        }
        Ok(TokenKind::Literal(Literal::new(
            LiteralKind::Synthetic,
            &self.src[start..self.index],
        )))
    }

    fn lex_number(&mut self) -> Result<TokenKind> {
        let start = self.index;
        while self.current().is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
        }
        let mut kind = LiteralKind::Integer;
        if self.current() == Some(b'.') && self.peek(1).is_some_and(|c| c.is_ascii_digit()) {
            kind = LiteralKind::Float;
            self.advance();
            while self.current().is_some_and(|c| c.is_ascii_digit()) {
                self.advance();
            }
        }
        let suffix_start = self.index;
        while self.current().is_some_and(|c| c.is_ascii_alphabetic()) {
            self.advance();
        }
        let suffix = &self.src[suffix_start..self.index];
        if !suffix.is_empty() {
            if !DURATION_UNITS.contains(&suffix) {
                return Err(self.error(format!("unknown duration unit '{suffix}'")));
            }
            kind = LiteralKind::Duration;
        }
        Ok(TokenKind::Literal(Literal::new(
            kind,
            &self.src[start..self.index],
        )))
    }

    fn lex_ident(&mut self) -> TokenKind {
        let start = self.index;
        while self
            .current()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_' || c == b'-')
        {
            self.advance();
        }
        // A trailing '-' belongs to the next token (`x -= 1`, `a- 1`).
        while self.index > start + 1 && self.bytes[self.index - 1] == b'-' {
            self.index -= 1;
            self.column -= 1;
        }
        let text = &self.src[start..self.index];
        if text.eq_ignore_ascii_case("true") || text.eq_ignore_ascii_case("false") {
            TokenKind::Literal(Literal::new(LiteralKind::Bool, text))
        } else {
            TokenKind::Ident(text.to_string())
        }
    }

    fn lex_punct(&mut self) -> Result<TokenKind> {
        let rest = &self.src[self.index..];
        for punct in PUNCTUATION {
            if rest.starts_with(punct) {
                for _ in 0..punct.len() {
                    self.advance();
                }
                return Ok(TokenKind::Punct(punct));
            }
        }
        let ch = rest.chars().next().unwrap_or('?');
        Err(self.error(format!("unexpected character '{ch}'")))
    }
}

struct Parser<'a> {
    unit: &'a str,
    tokens: Vec<Token>,
    index: usize,
}

fn is_operator_punct(punct: &str) -> bool {
    matches!(
        punct,
        "==" | "!=" | "<=" | ">=" | "<" | ">" | "~" | "|" | "^" | "&" | "*" | "/" | "%" | "=" | "||"
            | "&&" | "+=" | "-=" | "*=" | "/=" | ":" | "?"
    )
}

impl<'a> Parser<'a> {
    fn current(&self) -> &Token {
        &self.tokens[self.index.min(self.tokens.len() - 1)]
    }

    fn at_eof(&self) -> bool {
        matches!(self.current().kind, TokenKind::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if !self.at_eof() {
            self.index += 1;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        let token = self.current();
        CompileError::Syntax {
            unit: self.unit.to_string(),
            message: message.into(),
            line: token.line,
            column: token.column,
        }
    }

    fn is_punct(&self, punct: &str) -> bool {
        matches!(&self.current().kind, TokenKind::Punct(p) if *p == punct)
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(&self.current().kind, TokenKind::Ident(id) if id == keyword)
    }

    fn eat_punct(&mut self, punct: &str) -> bool {
        if self.is_punct(punct) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, punct: &str) -> Result<()> {
        if self.eat_punct(punct) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{punct}', found {}", self.describe())))
        }
    }

    fn expect_ident(&mut self) -> Result<String> {
        match &self.current().kind {
            TokenKind::Ident(id) => {
                let id = id.clone();
                self.advance();
                Ok(id)
            }
            _ => Err(self.error(format!("expected identifier, found {}", self.describe()))),
        }
    }

    fn describe(&self) -> String {
        match &self.current().kind {
            TokenKind::Ident(id) => format!("'{id}'"),
            TokenKind::Literal(lit) => format!("'{}'", lit.text),
            TokenKind::Punct(p) => format!("'{p}'"),
            TokenKind::Eof => "end of input".to_string(),
        }
    }

    fn parse_declaration(&mut self) -> Result<Option<Declaration>> {
        if self.eat_punct(";") {
            return Ok(None);
        }
        let keyword = self.expect_ident()?;
        match keyword.as_str() {
            "vcl" => {
                // Version header, e.g. `vcl 4.1;`.
                self.advance();
                self.expect_punct(";")?;
                Ok(None)
            }
            "include" => {
                let literal = self.expect_string()?;
                self.expect_punct(";")?;
                Ok(Some(Declaration::Include(literal)))
            }
            "probe" => Ok(Some(Declaration::Probe(self.parse_object()?))),
            "backend" => Ok(Some(Declaration::Backend(self.parse_object()?))),
            "acl" => Ok(Some(Declaration::Acl(self.parse_acl()?))),
            "sub" => {
                let name = self.expect_ident()?;
                let body = self.parse_block()?;
                Ok(Some(Declaration::Sub(SubDecl { name, body })))
            }
            other => Err(self.error(format!("unexpected top-level keyword '{other}'"))),
        }
    }

    fn expect_string(&mut self) -> Result<Literal> {
        match &self.current().kind {
            TokenKind::Literal(lit)
                if matches!(lit.kind, LiteralKind::String | LiteralKind::Synthetic) =>
            {
                let lit = lit.clone();
                self.advance();
                Ok(lit)
            }
            _ => Err(self.error(format!("expected string, found {}", self.describe()))),
        }
    }

    fn parse_object(&mut self) -> Result<ObjectDecl> {
        let name = self.expect_ident()?;
        let fields = self.parse_fields()?;
        Ok(ObjectDecl { name, fields })
    }

    fn parse_fields(&mut self) -> Result<Vec<FieldAssign>> {
        self.expect_punct("{")?;
        let mut fields = Vec::new();
        while !self.eat_punct("}") {
            if self.at_eof() {
                return Err(self.error("unterminated declaration body"));
            }
            if self.eat_punct(";") {
                continue;
            }
            self.expect_punct(".")?;
            let name = self.expect_ident()?;
            self.expect_punct("=")?;
            let value = if self.is_punct("{") {
                FieldValue::Inline(self.parse_fields()?)
            } else {
                match self.advance().kind {
                    TokenKind::Literal(lit) => FieldValue::Literal(lit),
                    TokenKind::Ident(id) => FieldValue::Name(id),
                    _ => {
                        self.index -= 1;
                        return Err(self.error(format!("expected field value, found {}", self.describe())));
                    }
                }
            };
            if !matches!(value, FieldValue::Inline(_)) || self.is_punct(";") {
                self.expect_punct(";")?;
            }
            fields.push(FieldAssign { name, value });
        }
        Ok(fields)
    }

    fn parse_acl(&mut self) -> Result<AclDecl> {
        let name = self.expect_ident()?;
        self.expect_punct("{")?;
        let mut entries = Vec::new();
        while !self.eat_punct("}") {
            if self.at_eof() {
                return Err(self.error("unterminated acl body"));
            }
            if self.eat_punct(";") {
                continue;
            }
            let negated = self.eat_punct("!");
            let (text, mut ignorable) = if self.eat_punct("(") {
                let text = self.expect_string()?;
                self.expect_punct(")")?;
                (text, true)
            } else {
                (self.expect_string()?, false)
            };
            if self.eat_punct("?") {
                ignorable = true;
            }
            let mask = if self.eat_punct("/") {
                match self.advance().kind {
                    TokenKind::Literal(lit) if lit.kind == LiteralKind::Integer => Some(lit.text),
                    _ => {
                        self.index -= 1;
                        return Err(self.error("expected subnet mask"));
                    }
                }
            } else {
                None
            };
            self.expect_punct(";")?;
            entries.push(AclLine {
                negated,
                ignorable,
                text,
                mask,
            });
        }
        Ok(AclDecl { name, entries })
    }

    fn parse_block(&mut self) -> Result<Vec<Statement>> {
        self.expect_punct("{")?;
        let mut statements = Vec::new();
        while !self.eat_punct("}") {
            if self.at_eof() {
                return Err(self.error("unterminated block"));
            }
            if self.eat_punct(";") {
                continue;
            }
            statements.push(self.parse_statement()?);
        }
        Ok(statements)
    }

    fn parse_statement(&mut self) -> Result<Statement> {
        if self.is_punct("{") {
            return Ok(Statement::Block(self.parse_block()?));
        }
        let keyword = self.expect_ident()?;
        let statement = match keyword.as_str() {
            "set" => {
                let target = self.parse_path()?;
                let op = match &self.current().kind {
                    TokenKind::Punct("=") => AssignOp::Set,
                    TokenKind::Punct("+=") => AssignOp::Add,
                    TokenKind::Punct("-=") => AssignOp::Sub,
                    TokenKind::Punct(other) => {
                        return Err(CompileError::UnknownOperator(other.to_string()));
                    }
                    _ => return Err(self.error("expected assignment operator")),
                };
                self.advance();
                let value = self.parse_expr()?;
                Statement::Set { target, op, value }
            }
            "unset" | "remove" => Statement::Unset(self.parse_path()?),
            "call" => Statement::Call(self.expect_ident()?),
            "return" => return self.parse_return(),
            "error" => {
                let status = match &self.current().kind {
                    TokenKind::Literal(lit) if lit.kind == LiteralKind::Integer => {
                        let text = lit.text.clone();
                        self.advance();
                        Some(text)
                    }
                    TokenKind::Ident(id) => {
                        let id = id.clone();
                        self.advance();
                        Some(id)
                    }
                    _ => None,
                };
                let description = match &self.current().kind {
                    TokenKind::Literal(lit)
                        if matches!(lit.kind, LiteralKind::String | LiteralKind::Synthetic) =>
                    {
                        let lit = lit.clone();
                        self.advance();
                        Some(lit)
                    }
                    _ => None,
                };
                Statement::Error {
                    status,
                    description,
                }
            }
            "if" => return self.parse_if(),
            "var" | "declare" => {
                let ty = self.expect_ident()?;
                let name = self.expect_ident()?;
                Statement::Var { ty, name }
            }
            "hash_data" => {
                self.expect_punct("(")?;
                let expr = self.parse_expr()?;
                self.expect_punct(")")?;
                Statement::HashData(expr)
            }
            "restart" => Statement::Restart,
            other => return Err(self.error(format!("unknown statement '{other}'"))),
        };
        self.expect_punct(";")?;
        Ok(statement)
    }

    fn parse_return(&mut self) -> Result<Statement> {
        if self.eat_punct(";") {
            return Ok(Statement::Return(None));
        }
        self.expect_punct("(")?;
        if self.eat_punct(")") {
            self.expect_punct(";")?;
            return Ok(Statement::Return(None));
        }
        let value = match &self.current().kind {
            TokenKind::Ident(id) if id.eq_ignore_ascii_case("synth") => {
                self.advance();
                if self.eat_punct("(") {
                    let (status, reason) = self.parse_status_args()?;
                    self.expect_punct(")")?;
                    ReturnValue::Synth { status, reason }
                } else {
                    ReturnValue::State("synth".to_string())
                }
            }
            TokenKind::Ident(id) => {
                let id = id.clone();
                self.advance();
                ReturnValue::State(id)
            }
            _ => {
                let (status, reason) = self.parse_status_args()?;
                ReturnValue::Synth { status, reason }
            }
        };
        self.expect_punct(")")?;
        self.expect_punct(";")?;
        Ok(Statement::Return(Some(value)))
    }

    fn parse_status_args(&mut self) -> Result<(Expr, Option<Expr>)> {
        let status = self.parse_expr()?;
        let reason = if self.eat_punct(",") {
            Some(self.parse_expr()?)
        } else {
            None
        };
        Ok((status, reason))
    }

    fn parse_if(&mut self) -> Result<Statement> {
        let mut branches = Vec::new();
        let mut otherwise = None;
        self.expect_punct("(")?;
        let cond = self.parse_expr()?;
        self.expect_punct(")")?;
        branches.push((cond, self.parse_block()?));
        loop {
            let chained = if self.is_keyword("else") {
                self.advance();
                if self.is_keyword("if") {
                    self.advance();
                    true
                } else {
                    otherwise = Some(self.parse_block()?);
                    break;
                }
            } else if self.is_keyword("elseif") || self.is_keyword("elsif") || self.is_keyword("elif")
            {
                self.advance();
                true
            } else {
                false
            };
            if !chained {
                break;
            }
            self.expect_punct("(")?;
            let cond = self.parse_expr()?;
            self.expect_punct(")")?;
            branches.push((cond, self.parse_block()?));
        }
        Ok(Statement::If {
            branches,
            otherwise,
        })
    }

    fn parse_path(&mut self) -> Result<Vec<String>> {
        let mut path = vec![self.expect_ident()?];
        while self.eat_punct(".") {
            path.push(self.expect_ident()?);
        }
        Ok(path)
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        let cond = self.parse_binary(0)?;
        if self.eat_punct("?") {
            let then = self.parse_expr()?;
            self.expect_punct(":")?;
            let otherwise = self.parse_expr()?;
            return Ok(Expr::Conditional {
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            });
        }
        Ok(cond)
    }

    fn binary_op(&self, level: usize) -> Option<BinaryOp> {
        let TokenKind::Punct(p) = &self.current().kind else {
            return None;
        };
        let op = match (level, *p) {
            (0, "||") => BinaryOp::Or,
            (1, "&&") => BinaryOp::And,
            (2, "|") => BinaryOp::BitOr,
            (3, "^") => BinaryOp::BitXor,
            (4, "&") => BinaryOp::BitAnd,
            (5, "==") => BinaryOp::Eq,
            (5, "!=") => BinaryOp::Ne,
            (6, "~") => BinaryOp::Match,
            (6, "!~") => BinaryOp::NotMatch,
            (7, "<") => BinaryOp::Lt,
            (7, "<=") => BinaryOp::Le,
            (7, ">") => BinaryOp::Gt,
            (7, ">=") => BinaryOp::Ge,
            (8, "+") => BinaryOp::Add,
            (8, "-") => BinaryOp::Sub,
            (9, "*") => BinaryOp::Mul,
            (9, "/") => BinaryOp::Div,
            (9, "%") => BinaryOp::Rem,
            _ => return None,
        };
        Some(op)
    }

    fn parse_binary(&mut self, level: usize) -> Result<Expr> {
        if level > 9 {
            return self.parse_unary();
        }
        let mut lhs = self.parse_binary(level + 1)?;
        while let Some(op) = self.binary_op(level) {
            self.advance();
            let rhs = self.parse_binary(level + 1)?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        let op = if self.eat_punct("!") {
            Some(UnaryOp::Not)
        } else if self.eat_punct("-") {
            Some(UnaryOp::Negate)
        } else {
            None
        };
        match op {
            Some(op) => Ok(Expr::Unary {
                op,
                expr: Box::new(self.parse_unary()?),
            }),
            None => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.current().kind.clone() {
            TokenKind::Literal(lit) => {
                self.advance();
                Ok(Expr::Literal(lit))
            }
            TokenKind::Ident(_) => Ok(Expr::Path(self.parse_path()?)),
            TokenKind::Punct("(") => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect_punct(")")?;
                Ok(expr)
            }
            TokenKind::Punct(p) if is_operator_punct(p) => {
                let mut text = p.to_string();
                let mut lookahead = self.index + 1;
                while let Some(Token {
                    kind: TokenKind::Punct(next),
                    ..
                }) = self.tokens.get(lookahead)
                {
                    if !is_operator_punct(next) && *next != "!" && *next != "+" && *next != "-" {
                        break;
                    }
                    text.push_str(next);
                    lookahead += 1;
                }
                Err(CompileError::UnknownOperator(text))
            }
            _ => Err(self.error(format!("expected expression, found {}", self.describe()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_sub(src: &str) -> Vec<Statement> {
        let unit = parse_source("test.vcl", src).expect("parse");
        match unit.declarations.into_iter().next() {
            Some(Declaration::Sub(sub)) => sub.body,
            other => panic!("expected sub, got {other:?}"),
        }
    }

    #[test]
    fn parses_objects_and_comments() {
        let src = r#"
            vcl 4.1;
            # probe used by every origin
            probe health { .url = "/health"; .timeout = 5s; }
            // primary origin
            backend web {
                .host = "127.0.0.1";
                .port = 8080;
                .probe = { .url = "/ping"; .window = 4; }
            }
            /* block
               comment */
            acl office { "10.0.0.0/8"; !"badhost.example"; ("maybe.example"); "192.168.0.0"/16; }
            include "extra.vcl";
        "#;
        let unit = parse_source("main.vcl", src).expect("parse");
        assert_eq!(unit.declarations.len(), 4);

        let Declaration::Backend(web) = &unit.declarations[1] else {
            panic!("backend expected");
        };
        assert_eq!(web.fields.len(), 3);
        assert!(matches!(&web.fields[2].value, FieldValue::Inline(inner) if inner.len() == 2));

        let Declaration::Acl(acl) = &unit.declarations[2] else {
            panic!("acl expected");
        };
        assert!(acl.entries[1].negated);
        assert!(acl.entries[2].ignorable);
        assert_eq!(acl.entries[3].mask.as_deref(), Some("16"));
    }

    #[test]
    fn literal_tokens_keep_their_raw_text() {
        let body = first_sub(r#"sub vcl_recv { set req.http.X-Msg = {"hi"}; set req.ttl = 1.5m; }"#);
        let Statement::Set { target, value, .. } = &body[0] else {
            panic!("set expected");
        };
        assert_eq!(target, &vec!["req".to_string(), "http".into(), "X-Msg".into()]);
        assert_eq!(
            value,
            &Expr::Literal(Literal::new(LiteralKind::Synthetic, "{\"hi\"}"))
        );
        let Statement::Set { value, .. } = &body[1] else {
            panic!("set expected");
        };
        assert_eq!(
            value,
            &Expr::Literal(Literal::new(LiteralKind::Duration, "1.5m"))
        );
    }

    #[test]
    fn precedence_binds_match_tighter_than_logical() {
        let body = first_sub(
            r#"sub vcl_recv { if (req.url ~ "^/a" && client.ip !~ office || 1 + 2 * 3 > 4) { return (pass); } }"#,
        );
        let Statement::If { branches, .. } = &body[0] else {
            panic!("if expected");
        };
        let Expr::Binary { op, lhs, rhs } = &branches[0].0 else {
            panic!("binary expected");
        };
        assert_eq!(*op, BinaryOp::Or);
        assert!(matches!(**lhs, Expr::Binary { op: BinaryOp::And, .. }));
        let Expr::Binary { op: BinaryOp::Gt, lhs: sum, .. } = &**rhs else {
            panic!("comparison expected");
        };
        assert!(matches!(
            &**sum,
            Expr::Binary { op: BinaryOp::Add, rhs, .. } if matches!(**rhs, Expr::Binary { op: BinaryOp::Mul, .. })
        ));
    }

    #[test]
    fn else_if_chains_are_flattened() {
        let body = first_sub(
            r#"sub vcl_recv {
                if (req.method == "PURGE") { return (purge); }
                else if (req.method == "POST") { return (pass); }
                elsif (req.url ~ "x") { return (pipe); }
                else { return (hash); }
            }"#,
        );
        let Statement::If {
            branches,
            otherwise,
        } = &body[0]
        else {
            panic!("if expected");
        };
        assert_eq!(branches.len(), 3);
        assert!(otherwise.is_some());
    }

    #[test]
    fn return_forms() {
        let body = first_sub(
            r#"sub vcl_recv {
                return;
                return (hit-for-pass);
                return (synth(404, "Missing"));
                return (503, "Down");
            }"#,
        );
        assert_eq!(body[0], Statement::Return(None));
        assert_eq!(
            body[1],
            Statement::Return(Some(ReturnValue::State("hit-for-pass".into())))
        );
        assert!(matches!(
            &body[2],
            Statement::Return(Some(ReturnValue::Synth { reason: Some(_), .. }))
        ));
        assert!(matches!(
            &body[3],
            Statement::Return(Some(ReturnValue::Synth { .. }))
        ));
    }

    #[test]
    fn error_statement_variants() {
        let body = first_sub(r#"sub vcl_recv { error 403 "Forbidden"; error NotFound; error; }"#);
        assert_eq!(
            body[0],
            Statement::Error {
                status: Some("403".into()),
                description: Some(Literal::new(LiteralKind::String, "\"Forbidden\"")),
            }
        );
        assert_eq!(
            body[1],
            Statement::Error {
                status: Some("NotFound".into()),
                description: None
            }
        );
        assert_eq!(
            body[2],
            Statement::Error {
                status: None,
                description: None
            }
        );
    }

    #[test]
    fn unknown_operators_are_reported() {
        let err = parse_source("t", "sub vcl_recv { if (req.url === \"/\") { return (pass); } }")
            .unwrap_err();
        assert_eq!(err, CompileError::UnknownOperator("=".into()));

        let err = parse_source("t", "sub vcl_recv { set req.url *= 2; }").unwrap_err();
        assert_eq!(err, CompileError::UnknownOperator("*=".into()));
    }

    #[test]
    fn syntax_errors_carry_position() {
        let err = parse_source("bad.vcl", "backend b1 {\n  .host = ;\n}").unwrap_err();
        match err {
            CompileError::Syntax { unit, line, .. } => {
                assert_eq!(unit, "bad.vcl");
                assert_eq!(line, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn duration_units_are_validated_by_the_lexer() {
        assert!(parse_source("t", "probe p { .timeout = 5q; }").is_err());
    }
}
