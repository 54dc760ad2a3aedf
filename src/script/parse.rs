use std::sync::Arc;

use winnow::ascii::{digit1, multispace1, till_line_ending};
use winnow::combinator::{alt, opt, repeat};
use winnow::error::ModalResult;
use winnow::prelude::*;
use winnow::token::{any, one_of, take_while};

use super::compile::CompileError;
use super::language::{Arg, BinaryOp, Block, Expr, FnDef, FnKind, Literal, Name, Script, Stmt, UnaryOp};
use crate::location::{FileName, Point, Span};

#[derive(Clone, Debug, PartialEq)]
enum Tok {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    Sym(&'static str),
    Eof,
}

#[derive(Clone, Debug, PartialEq)]
struct Token {
    tok: Tok,
    start: usize,
    end: usize,
}

const SYMBOLS: &[&str] = &[
    "==", "!=", "<=", ">=", "&&", "||", "(", ")", "{", "}", "[", "]", ",", "=", "<", ">", "+", "-",
    "*", "/", "%", "!", ".", ";",
];

const KEYWORDS: &[&str] = &[
    "let", "fn", "if", "else", "for", "in", "while", "return", "cache", "resource", "fragment",
    "with", "try", "catch", "stop", "rerun", "raise", "true", "false", "none",
];

fn trivia(input: &mut &str) -> ModalResult<()> {
    repeat(
        0..,
        alt((
            multispace1.void(),
            ("//", till_line_ending).void(),
            ('#', till_line_ending).void(),
        )),
    )
    .parse_next(input)
}

fn identifier<'s>(input: &mut &'s str) -> ModalResult<&'s str> {
    (
        one_of(|c: char| c.is_alphabetic() || c == '_'),
        take_while(0.., |c: char| c.is_alphanumeric() || c == '_'),
    )
        .take()
        .parse_next(input)
}

fn number<'s>(input: &mut &'s str) -> ModalResult<&'s str> {
    (digit1, opt(('.', digit1))).take().parse_next(input)
}

fn string(input: &mut &str) -> ModalResult<String> {
    '"'.parse_next(input)?;
    let mut out = String::new();
    loop {
        match any.parse_next(input)? {
            '"' => return Ok(out),
            '\\' => match any.parse_next(input)? {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                other => out.push(other),
            },
            other => out.push(other),
        }
    }
}

fn symbol(input: &mut &str) -> ModalResult<&'static str> {
    let two = alt(("==", "!=", "<=", ">=", "&&", "||"));
    let one = one_of([
        '(', ')', '{', '}', '[', ']', ',', '=', '<', '>', '+', '-', '*', '/', '%', '!', '.', ';',
    ])
    .take();
    let text = alt((two, one)).parse_next(input)?;
    Ok(SYMBOLS.iter().copied().find(|s| *s == text).unwrap_or(";"))
}

fn lex(source: &str) -> Result<Vec<Token>, (usize, usize, String)> {
    let mut input = source;
    let mut tokens = Vec::new();
    loop {
        let _ = trivia.parse_next(&mut input);
        let start = source.len() - input.len();
        let Some(first) = input.chars().next() else {
            break;
        };

        let tok = if first == '"' {
            string
                .parse_next(&mut input)
                .map(Tok::Str)
                .map_err(|_| (start, source.len(), "unterminated string literal".to_string()))?
        } else if first.is_ascii_digit() {
            let text = number
                .parse_next(&mut input)
                .map_err(|_| (start, start + 1, "invalid number".to_string()))?;
            let end = start + text.len();
            if text.contains('.') {
                Tok::Float(
                    text.parse()
                        .map_err(|_| (start, end, format!("invalid number `{text}`")))?,
                )
            } else {
                Tok::Int(
                    text.parse()
                        .map_err(|_| (start, end, format!("integer `{text}` is too large")))?,
                )
            }
        } else if first.is_alphabetic() || first == '_' {
            let text = identifier
                .parse_next(&mut input)
                .map_err(|_| (start, start + 1, "invalid identifier".to_string()))?;
            Tok::Ident(text.to_string())
        } else {
            let text = symbol.parse_next(&mut input).map_err(|_| {
                (
                    start,
                    start + first.len_utf8(),
                    format!("unexpected character `{first}`"),
                )
            })?;
            Tok::Sym(text)
        };

        let end = source.len() - input.len();
        tokens.push(Token { tok, start, end });
    }
    tokens.push(Token {
        tok: Tok::Eof,
        start: source.len(),
        end: source.len(),
    });
    Ok(tokens)
}

/// Parses a page script. `file` only labels spans.
pub fn parse(source: &str, file: FileName) -> Result<Script, CompileError> {
    let tokens = lex(source).map_err(|(start, end, message)| CompileError::Syntax {
        span: span_of(source, &file, start, end),
        message,
    })?;
    let mut parser = TokenParser {
        source,
        file,
        tokens,
        pos: 0,
        depth: 0,
    };
    let mut statements = Vec::new();
    while !parser.at_eof() {
        statements.push(parser.statement()?);
    }
    Ok(Script { statements })
}

fn span_of(source: &str, file: &FileName, start: usize, end: usize) -> Span {
    Span::At {
        start: Point::at_offset(source, start),
        end: Point::at_offset(source, end),
        file: file.clone(),
    }
}

const MAX_NESTING: usize = 256;

struct TokenParser<'s> {
    source: &'s str,
    file: FileName,
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl<'s> TokenParser<'s> {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, ahead: usize) -> &Token {
        &self.tokens[(self.pos + ahead).min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn at_eof(&self) -> bool {
        self.peek().tok == Tok::Eof
    }

    fn previous_end(&self) -> usize {
        match self.pos {
            0 => 0,
            pos => self.tokens[pos - 1].end,
        }
    }

    fn span(&self, start: usize, end: usize) -> Span {
        span_of(self.source, &self.file, start, end)
    }

    fn span_from(&self, start: usize) -> Span {
        self.span(start, self.previous_end().max(start))
    }

    fn error(&self, token: &Token, message: impl Into<String>) -> CompileError {
        CompileError::Syntax {
            span: self.span(token.start, token.end.max(token.start + 1)),
            message: message.into(),
        }
    }

    fn describe(token: &Token) -> String {
        match &token.tok {
            Tok::Ident(name) => format!("`{name}`"),
            Tok::Int(value) => format!("`{value}`"),
            Tok::Float(value) => format!("`{value}`"),
            Tok::Str(_) => "a string".to_string(),
            Tok::Sym(symbol) => format!("`{symbol}`"),
            Tok::Eof => "end of file".to_string(),
        }
    }

    fn is_sym(&self, symbol: &str) -> bool {
        matches!(&self.peek().tok, Tok::Sym(s) if *s == symbol)
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(&self.peek().tok, Tok::Ident(s) if s == keyword)
    }

    fn eat_sym(&mut self, symbol: &str) -> bool {
        if self.is_sym(symbol) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.is_keyword(keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_sym(&mut self, symbol: &str) -> Result<Token, CompileError> {
        if self.is_sym(symbol) {
            Ok(self.advance())
        } else {
            let token = self.peek().clone();
            Err(self.error(
                &token,
                format!("expected `{symbol}`, found {}", Self::describe(&token)),
            ))
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), CompileError> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            let token = self.peek().clone();
            Err(self.error(
                &token,
                format!("expected `{keyword}`, found {}", Self::describe(&token)),
            ))
        }
    }

    fn name(&mut self) -> Result<Name, CompileError> {
        let token = self.peek().clone();
        match &token.tok {
            Tok::Ident(text) if !KEYWORDS.contains(&text.as_str()) => {
                self.advance();
                Ok(Name {
                    span: self.span(token.start, token.end),
                    text: text.clone(),
                })
            }
            _ => Err(self.error(
                &token,
                format!("expected a name, found {}", Self::describe(&token)),
            )),
        }
    }

    fn nest(&mut self) -> Result<(), CompileError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            let token = self.peek().clone();
            return Err(self.error(&token, "nesting is too deep"));
        }
        Ok(())
    }

    fn block(&mut self) -> Result<Block, CompileError> {
        let open = self.expect_sym("{")?;
        self.nest()?;
        let mut statements = Vec::new();
        while !self.is_sym("}") {
            if self.at_eof() {
                return Err(self.error(&open, "this block is never closed"));
            }
            statements.push(self.statement()?);
        }
        self.advance();
        self.depth -= 1;
        Ok(Block {
            span: self.span_from(open.start),
            statements,
        })
    }

    fn statement(&mut self) -> Result<Stmt, CompileError> {
        let start = self.peek().start;
        let statement = self.statement_inner(start)?;
        self.eat_sym(";");
        Ok(statement)
    }

    fn statement_inner(&mut self, start: usize) -> Result<Stmt, CompileError> {
        let Tok::Ident(word) = self.peek().tok.clone() else {
            return Ok(Stmt::Expr(self.expression()?));
        };

        match word.as_str() {
            "let" => {
                self.advance();
                let name = self.name()?;
                self.expect_sym("=")?;
                let value = self.expression()?;
                Ok(Stmt::Let {
                    span: self.span_from(start),
                    name,
                    value,
                })
            }
            "if" => self.if_statement(start),
            "for" => {
                self.advance();
                let var = self.name()?;
                self.expect_keyword("in")?;
                let iter = self.expression()?;
                let body = self.block()?;
                Ok(Stmt::For {
                    span: self.span_from(start),
                    var,
                    iter,
                    body,
                })
            }
            "while" => {
                self.advance();
                let condition = self.expression()?;
                let body = self.block()?;
                Ok(Stmt::While {
                    span: self.span_from(start),
                    condition,
                    body,
                })
            }
            "fn" => {
                self.advance();
                self.function(start, FnKind::Plain)
            }
            "cache" => {
                self.advance();
                let kind = self.cache_kind()?;
                self.expect_keyword("fn")?;
                self.function(start, kind)
            }
            "fragment" => {
                self.advance();
                self.function(start, FnKind::Fragment)
            }
            "return" => {
                self.advance();
                let value = if self.is_sym("}") || self.is_sym(";") || self.at_eof() {
                    None
                } else {
                    Some(self.expression()?)
                };
                Ok(Stmt::Return {
                    span: self.span_from(start),
                    value,
                })
            }
            "with" => {
                self.advance();
                let container = self.name()?;
                self.expect_sym("(")?;
                let args = self.arguments()?;
                let body = self.block()?;
                Ok(Stmt::With {
                    span: self.span_from(start),
                    container,
                    args,
                    body,
                })
            }
            "try" => {
                self.advance();
                let body = self.block()?;
                self.expect_keyword("catch")?;
                let error = self.name()?;
                let handler = self.block()?;
                Ok(Stmt::Try {
                    span: self.span_from(start),
                    body,
                    error,
                    handler,
                })
            }
            "stop" => {
                self.advance();
                Ok(Stmt::Stop(self.span_from(start)))
            }
            "rerun" => {
                self.advance();
                Ok(Stmt::Rerun(self.span_from(start)))
            }
            "raise" => {
                self.advance();
                let value = self.expression()?;
                Ok(Stmt::Raise {
                    span: self.span_from(start),
                    value,
                })
            }
            _ if matches!(&self.peek_at(1).tok, Tok::Sym("=")) => {
                let name = self.name()?;
                self.advance();
                let value = self.expression()?;
                Ok(Stmt::Assign {
                    span: self.span_from(start),
                    name,
                    value,
                })
            }
            _ if matches!(&self.peek_at(1).tok, Tok::Sym("."))
                && matches!(&self.peek_at(2).tok, Tok::Ident(method) if method == "clear") =>
            {
                let function = self.name()?;
                self.advance();
                self.advance();
                self.expect_sym("(")?;
                let args = self.arguments()?;
                Ok(Stmt::ClearCache {
                    span: self.span_from(start),
                    function,
                    args,
                })
            }
            _ => Ok(Stmt::Expr(self.expression()?)),
        }
    }

    fn if_statement(&mut self, start: usize) -> Result<Stmt, CompileError> {
        let mut branches = Vec::new();
        let mut otherwise = None;
        self.expect_keyword("if")?;
        loop {
            let condition = self.expression()?;
            let body = self.block()?;
            branches.push((condition, body));
            if !self.eat_keyword("else") {
                break;
            }
            if !self.eat_keyword("if") {
                otherwise = Some(self.block()?);
                break;
            }
        }
        Ok(Stmt::If {
            span: self.span_from(start),
            branches,
            otherwise,
        })
    }

    fn cache_kind(&mut self) -> Result<FnKind, CompileError> {
        let mut ttl_secs = None;
        let mut max_entries = None;
        if self.eat_sym("(") {
            while !self.eat_sym(")") {
                let option = self.name()?;
                self.expect_sym("=")?;
                let token = self.advance();
                let Tok::Int(value) = token.tok else {
                    return Err(self.error(&token, "cache options take whole numbers"));
                };
                let Ok(value) = u64::try_from(value) else {
                    return Err(self.error(&token, "cache options cannot be negative"));
                };
                match option.text.as_str() {
                    "ttl" => ttl_secs = Some(value),
                    "max_entries" => max_entries = Some(value as usize),
                    _ => {
                        return Err(CompileError::Syntax {
                            span: option.span,
                            message: format!(
                                "unknown cache option `{}`, expected `ttl` or `max_entries`",
                                option.text
                            ),
                        })
                    }
                }
                if !self.is_sym(")") {
                    self.expect_sym(",")?;
                }
            }
        }
        let resource = self.eat_keyword("resource");
        Ok(FnKind::Cached {
            resource,
            ttl_secs,
            max_entries,
        })
    }

    fn function(&mut self, start: usize, kind: FnKind) -> Result<Stmt, CompileError> {
        let name = self.name()?;
        self.expect_sym("(")?;
        let mut params = Vec::new();
        while !self.eat_sym(")") {
            params.push(self.name()?);
            if !self.is_sym(")") {
                self.expect_sym(",")?;
            }
        }
        let body = self.block()?;
        let end = self.previous_end();
        Ok(Stmt::Fn(Arc::new(FnDef {
            span: self.span(start, end),
            name,
            params,
            body,
            kind,
            code: self.source[start..end].to_string(),
        })))
    }

    /// Parses arguments after an already consumed `(`, through the `)`.
    fn arguments(&mut self) -> Result<Vec<Arg>, CompileError> {
        let mut args = Vec::new();
        while !self.eat_sym(")") {
            let named = matches!(&self.peek().tok, Tok::Ident(_))
                && matches!(&self.peek_at(1).tok, Tok::Sym("="));
            let name = if named {
                let name = self.name()?;
                self.advance();
                Some(name)
            } else {
                None
            };
            let value = self.expression()?;
            args.push(Arg { name, value });
            if !self.is_sym(")") {
                self.expect_sym(",")?;
            }
        }
        Ok(args)
    }

    fn expression(&mut self) -> Result<Expr, CompileError> {
        self.nest()?;
        let expr = self.binary(0)?;
        self.depth -= 1;
        Ok(expr)
    }

    fn binary_op(&self, level: usize) -> Option<BinaryOp> {
        let Tok::Sym(symbol) = &self.peek().tok else {
            return None;
        };
        let op = match *symbol {
            "||" => BinaryOp::Or,
            "&&" => BinaryOp::And,
            "==" => BinaryOp::Eq,
            "!=" => BinaryOp::Ne,
            "<" => BinaryOp::Lt,
            "<=" => BinaryOp::Le,
            ">" => BinaryOp::Gt,
            ">=" => BinaryOp::Ge,
            "+" => BinaryOp::Add,
            "-" => BinaryOp::Sub,
            "*" => BinaryOp::Mul,
            "/" => BinaryOp::Div,
            "%" => BinaryOp::Rem,
            _ => return None,
        };
        (Self::precedence(op) == level).then_some(op)
    }

    fn precedence(op: BinaryOp) -> usize {
        match op {
            BinaryOp::Or => 0,
            BinaryOp::And => 1,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => 2,
            BinaryOp::Add | BinaryOp::Sub => 3,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => 4,
        }
    }

    fn binary(&mut self, level: usize) -> Result<Expr, CompileError> {
        if level > 4 {
            return self.unary();
        }
        let start = self.peek().start;
        let mut left = self.binary(level + 1)?;
        while let Some(op) = self.binary_op(level) {
            self.advance();
            let right = self.binary(level + 1)?;
            left = Expr::Binary {
                span: self.span_from(start),
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, CompileError> {
        let start = self.peek().start;
        let op = if self.eat_sym("-") {
            UnaryOp::Neg
        } else if self.eat_sym("!") {
            UnaryOp::Not
        } else {
            return self.postfix();
        };
        self.nest()?;
        let operand = self.unary()?;
        self.depth -= 1;
        Ok(Expr::Unary {
            span: self.span_from(start),
            op,
            operand: Box::new(operand),
        })
    }

    fn postfix(&mut self) -> Result<Expr, CompileError> {
        let start = self.peek().start;
        let mut expr = self.primary()?;
        while self.eat_sym("[") {
            let index = self.expression()?;
            self.expect_sym("]")?;
            expr = Expr::Index {
                span: self.span_from(start),
                target: Box::new(expr),
                index: Box::new(index),
            };
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, CompileError> {
        let token = self.peek().clone();
        let literal = |parser: &Self, literal| Expr::Literal(parser.span(token.start, token.end), literal);
        match &token.tok {
            Tok::Int(value) => {
                self.advance();
                Ok(literal(self, Literal::Int(*value)))
            }
            Tok::Float(value) => {
                self.advance();
                Ok(literal(self, Literal::Float(*value)))
            }
            Tok::Str(value) => {
                self.advance();
                Ok(literal(self, Literal::Str(value.clone())))
            }
            Tok::Ident(word) if word == "true" || word == "false" => {
                self.advance();
                Ok(literal(self, Literal::Bool(word == "true")))
            }
            Tok::Ident(word) if word == "none" => {
                self.advance();
                Ok(literal(self, Literal::None))
            }
            Tok::Ident(_) => {
                let name = self.name()?;
                if self.eat_sym("(") {
                    let args = self.arguments()?;
                    Ok(Expr::Call {
                        span: self.span_from(token.start),
                        callee: name,
                        args,
                    })
                } else {
                    Ok(Expr::Var(name))
                }
            }
            Tok::Sym("(") => {
                self.advance();
                let expr = self.expression()?;
                self.expect_sym(")")?;
                Ok(expr)
            }
            Tok::Sym("[") => {
                self.advance();
                let mut items = Vec::new();
                while !self.eat_sym("]") {
                    items.push(self.expression()?);
                    if !self.is_sym("]") {
                        self.expect_sym(",")?;
                    }
                }
                Ok(Expr::List(self.span_from(token.start), items))
            }
            _ => Err(self.error(
                &token,
                format!("expected an expression, found {}", Self::describe(&token)),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Script {
        match parse(source, FileName::inline()) {
            Ok(script) => script,
            Err(error) => panic!("{error:?}"),
        }
    }

    #[test]
    fn lexer_skips_comments_and_reads_literals() {
        let tokens = lex("let x = 1.5 // trailing\n# hash comment\n\"a\\\"b\"").unwrap();
        let kinds: Vec<Tok> = tokens.into_iter().map(|t| t.tok).collect();
        assert_eq!(
            kinds,
            vec![
                Tok::Ident("let".to_string()),
                Tok::Ident("x".to_string()),
                Tok::Sym("="),
                Tok::Float(1.5),
                Tok::Str("a\"b".to_string()),
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn precedence_binds_tighter_operators_first() {
        let script = parse_ok("let x = 1 + 2 * 3 == 7 && !false");
        let Stmt::Let { value, .. } = &script.statements[0] else {
            panic!("expected let");
        };
        let Expr::Binary { op: BinaryOp::And, left, .. } = value else {
            panic!("expected && at the top, got {value:?}");
        };
        let Expr::Binary { op: BinaryOp::Eq, left, .. } = left.as_ref() else {
            panic!("expected ==");
        };
        assert!(matches!(left.as_ref(), Expr::Binary { op: BinaryOp::Add, .. }));
    }

    #[test]
    fn parses_every_statement_form() {
        let script = parse_ok(
            r#"
            cache(ttl = 5, max_entries = 10) fn load(a, _conn) { return a * 2 }
            cache resource fn connect(name) { return connection(name) }
            fragment ticker() { text("tick") }
            fn greet(who) { text("hello " + str(who)) }
            let items = [1, 2, 3]
            for item in items { write(item) }
            let i = 0
            while i < 3 { i = i + 1 }
            if checkbox("show", value = true) { greet("you") } else if false { stop } else { rerun }
            with expander("more") { ticker() }
            try { raise "boom" } catch err { error(err) }
            load.clear()
            load.clear(1, none)
            "#,
        );
        assert_eq!(script.statements.len(), 13);
        let Stmt::Fn(load) = &script.statements[0] else {
            panic!("expected fn");
        };
        assert_eq!(
            load.kind,
            FnKind::Cached {
                resource: false,
                ttl_secs: Some(5),
                max_entries: Some(10),
            }
        );
        assert!(load.code.starts_with("cache(ttl = 5"));
        assert!(load.code.ends_with('}'));
        assert!(matches!(&script.statements[11], Stmt::ClearCache { args, .. } if args.is_empty()));
    }

    #[test]
    fn syntax_errors_point_at_the_offending_token() {
        let error = parse("let = 3", FileName::inline()).unwrap_err();
        let CompileError::Syntax { span, message } = error else {
            panic!("expected a syntax error");
        };
        assert!(message.contains("expected a name"));
        assert_eq!(span.start().map(|p| p.column), Some(4));

        assert!(matches!(
            parse("if true { text(\"x\")", FileName::inline()),
            Err(CompileError::Syntax { .. })
        ));
        assert!(matches!(
            parse("text(\"unterminated)", FileName::inline()),
            Err(CompileError::Syntax { .. })
        ));
        assert!(matches!(parse("let x = 1 @ 2", FileName::inline()), Err(CompileError::Syntax { .. })));
    }
}
