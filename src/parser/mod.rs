pub mod ast;

use crate::diagnostics::CompileError;
use crate::lexer::token::Token;
use crate::span::{Span, Spanned};
use ast::*;

pub struct Parser<'a> {
    tokens: &'a [Spanned<Token>],
    source: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: &'a [Spanned<Token>], source: &'a str) -> Self {
        Self { tokens, source, pos: 0 }
    }

    pub fn parse_unit(&mut self) -> Result<Unit, CompileError> {
        let mut classes = Vec::new();
        while self.peek().is_some() {
            classes.push(self.parse_class()?);
        }
        Ok(Unit { classes })
    }

    // --- Declarations ---

    fn parse_class(&mut self) -> Result<ClassDecl, CompileError> {
        self.skip_modifiers();
        let start = self.current_span();
        let is_struct = match self.peek() {
            Some(Token::Class) => {
                self.advance();
                false
            }
            Some(Token::Struct) => {
                self.advance();
                true
            }
            Some(Token::Interface) | Some(Token::Enum) => {
                return Err(CompileError::syntax(
                    "only class and struct declarations are supported",
                    self.current_span(),
                ));
            }
            _ => {
                return Err(CompileError::syntax(
                    "expected a type declaration",
                    self.current_span(),
                ));
            }
        };
        let name = self.expect_ident()?;
        self.expect(&Token::LBrace)?;

        let mut fields = Vec::new();
        let mut methods = Vec::new();
        while !matches!(self.peek(), Some(Token::RBrace) | None) {
            self.parse_member(&name.node, &mut fields, &mut methods)?;
        }
        let end = self.expect(&Token::RBrace)?.span;

        Ok(ClassDecl {
            name: name.node,
            is_struct,
            fields,
            methods,
            span: start.merge(end),
        })
    }

    fn parse_member(
        &mut self,
        class_name: &str,
        fields: &mut Vec<FieldDecl>,
        methods: &mut Vec<MethodDecl>,
    ) -> Result<(), CompileError> {
        let is_static = self.skip_modifiers();
        let start = self.current_span();

        // Constructor: `Name(...)` where Name matches the class.
        if matches!(self.peek(), Some(Token::Ident))
            && self.peek_text() == Some(class_name)
            && matches!(self.peek_ahead(1), Some(Token::LParen))
        {
            let name = self.expect_ident()?;
            let params = self.parse_params()?;
            let body = self.parse_block()?;
            methods.push(MethodDecl {
                name: name.node,
                params,
                ret: "void".to_string(),
                is_static,
                is_ctor: true,
                body,
                span: start,
            });
            return Ok(());
        }

        let ty = self.parse_type()?;
        let name = self.expect_ident()?;
        match self.peek() {
            Some(Token::LParen) => {
                let params = self.parse_params()?;
                let body = self.parse_block()?;
                methods.push(MethodDecl {
                    name: name.node,
                    params,
                    ret: ty,
                    is_static,
                    is_ctor: false,
                    body,
                    span: start,
                });
            }
            Some(Token::Semi) => {
                if ty == "void" {
                    return Err(CompileError::syntax("a field cannot be void", name.span));
                }
                self.advance();
                fields.push(FieldDecl { name: name.node, ty, is_static, span: start });
            }
            Some(Token::Eq) => {
                return Err(CompileError::syntax(
                    "field initializers are not supported",
                    self.current_span(),
                ));
            }
            _ => {
                return Err(CompileError::syntax(
                    "expected '(' or ';' after member name",
                    self.current_span(),
                ));
            }
        }
        Ok(())
    }

    fn parse_params(&mut self) -> Result<Vec<Param>, CompileError> {
        self.expect(&Token::LParen)?;
        let mut params = Vec::new();
        if !matches!(self.peek(), Some(Token::RParen)) {
            loop {
                let ty = self.parse_type()?;
                let name = self.expect_ident()?;
                params.push(Param { name: name.node, ty });
                if matches!(self.peek(), Some(Token::Comma)) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(&Token::RParen)?;
        Ok(params)
    }

    fn parse_type(&mut self) -> Result<String, CompileError> {
        if matches!(self.peek(), Some(Token::Void)) {
            self.advance();
            return Ok("void".to_string());
        }
        Ok(self.expect_ident()?.node)
    }

    // --- Statements ---

    fn parse_block(&mut self) -> Result<Vec<Stmt>, CompileError> {
        self.expect(&Token::LBrace)?;
        let mut stmts = Vec::new();
        while !matches!(self.peek(), Some(Token::RBrace) | None) {
            stmts.push(self.parse_stmt()?);
        }
        self.expect(&Token::RBrace)?;
        Ok(stmts)
    }

    fn parse_stmt(&mut self) -> Result<Stmt, CompileError> {
        let start = self.current_span();
        match self.peek() {
            Some(Token::If) => self.parse_if(),
            Some(Token::While) => {
                self.advance();
                self.expect(&Token::LParen)?;
                let cond = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                let body = self.parse_block()?;
                Ok(Stmt::While { cond, body, span: start })
            }
            Some(Token::Return) => {
                self.advance();
                let value = if matches!(self.peek(), Some(Token::Semi)) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.expect(&Token::Semi)?;
                Ok(Stmt::Return { value, span: start })
            }
            Some(Token::Try) => {
                self.advance();
                let body = self.parse_block()?;
                self.expect(&Token::Catch)?;
                if matches!(self.peek(), Some(Token::LParen)) {
                    self.advance();
                    // `catch (Exception e)`: type and optional binding,
                    // both ignored by the lowering.
                    self.expect_ident()?;
                    if matches!(self.peek(), Some(Token::Ident)) {
                        self.advance();
                    }
                    self.expect(&Token::RParen)?;
                }
                let catch_body = self.parse_block()?;
                Ok(Stmt::Try { body, catch_body, span: start })
            }
            Some(Token::This) => {
                // `this.f = …;`, `this.f++;`, or an expression statement.
                if matches!(self.peek_ahead(1), Some(Token::Dot)) {
                    match self.peek_ahead(3) {
                        Some(Token::Eq) => {
                            self.advance();
                            self.advance();
                            let field = self.expect_ident()?;
                            self.expect(&Token::Eq)?;
                            let value = self.parse_expr()?;
                            self.expect(&Token::Semi)?;
                            return Ok(Stmt::Assign {
                                target: Target::ThisField(field.node),
                                value,
                                span: start,
                            });
                        }
                        Some(Token::PlusPlus) | Some(Token::MinusMinus) => {
                            self.advance();
                            self.advance();
                            let field = self.expect_ident()?;
                            let delta = if matches!(self.peek(), Some(Token::PlusPlus)) { 1 } else { -1 };
                            self.advance();
                            self.expect(&Token::Semi)?;
                            return Ok(Stmt::Incr {
                                target: Target::ThisField(field.node),
                                delta,
                                span: start,
                            });
                        }
                        _ => {}
                    }
                }
                self.parse_expr_stmt(start)
            }
            Some(Token::Ident) => {
                // Local declaration: `Type name = …;` or `Type name;`
                if matches!(self.peek_ahead(1), Some(Token::Ident))
                    && matches!(self.peek_ahead(2), Some(Token::Eq) | Some(Token::Semi))
                {
                    let ty = self.expect_ident()?.node;
                    let name = self.expect_ident()?.node;
                    let init = if matches!(self.peek(), Some(Token::Eq)) {
                        self.advance();
                        Some(self.parse_expr()?)
                    } else {
                        None
                    };
                    self.expect(&Token::Semi)?;
                    return Ok(Stmt::Local { ty, name, init, span: start });
                }
                // Assignment / increment on a bare name.
                match self.peek_ahead(1) {
                    Some(Token::Eq) => {
                        let name = self.expect_ident()?.node;
                        self.expect(&Token::Eq)?;
                        let value = self.parse_expr()?;
                        self.expect(&Token::Semi)?;
                        Ok(Stmt::Assign { target: Target::Name(name), value, span: start })
                    }
                    Some(Token::PlusPlus) | Some(Token::MinusMinus) => {
                        let name = self.expect_ident()?.node;
                        let delta = if matches!(self.peek(), Some(Token::PlusPlus)) { 1 } else { -1 };
                        self.advance();
                        self.expect(&Token::Semi)?;
                        Ok(Stmt::Incr { target: Target::Name(name), delta, span: start })
                    }
                    _ => self.parse_expr_stmt(start),
                }
            }
            _ => self.parse_expr_stmt(start),
        }
    }

    fn parse_if(&mut self) -> Result<Stmt, CompileError> {
        let start = self.current_span();
        self.expect(&Token::If)?;
        self.expect(&Token::LParen)?;
        let cond = self.parse_expr()?;
        self.expect(&Token::RParen)?;
        let then_body = self.parse_block()?;
        let else_body = if matches!(self.peek(), Some(Token::Else)) {
            self.advance();
            if matches!(self.peek(), Some(Token::If)) {
                vec![self.parse_if()?]
            } else {
                self.parse_block()?
            }
        } else {
            Vec::new()
        };
        Ok(Stmt::If { cond, then_body, else_body, span: start })
    }

    fn parse_expr_stmt(&mut self, start: Span) -> Result<Stmt, CompileError> {
        let expr = self.parse_expr()?;
        self.expect(&Token::Semi)?;
        Ok(Stmt::Expr { expr, span: start })
    }

    // --- Expressions (precedence climbing) ---

    fn parse_expr(&mut self) -> Result<Expr, CompileError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Token::PipePipe)) {
            self.advance();
            let rhs = self.parse_and()?;
            let span = lhs.span().merge(rhs.span());
            lhs = Expr::Binary { op: BinOp::Or, lhs: Box::new(lhs), rhs: Box::new(rhs), span };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_equality()?;
        while matches!(self.peek(), Some(Token::AmpAmp)) {
            self.advance();
            let rhs = self.parse_equality()?;
            let span = lhs.span().merge(rhs.span());
            lhs = Expr::Binary { op: BinOp::And, lhs: Box::new(lhs), rhs: Box::new(rhs), span };
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_relational()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinOp::Eq,
                Some(Token::BangEq) => BinOp::Ne,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_relational()?;
            let span = lhs.span().merge(rhs.span());
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs), span };
        }
        Ok(lhs)
    }

    fn parse_relational(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::LtEq) => BinOp::Le,
                Some(Token::GtEq) => BinOp::Ge,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_additive()?;
            let span = lhs.span().merge(rhs.span());
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs), span };
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_multiplicative()?;
            let span = lhs.span().merge(rhs.span());
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs), span };
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Rem,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary()?;
            let span = lhs.span().merge(rhs.span());
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs), span };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, CompileError> {
        match self.peek() {
            Some(Token::Bang) => {
                let start = self.current_span();
                self.advance();
                let operand = self.parse_unary()?;
                let span = start.merge(operand.span());
                Ok(Expr::Unary { op: UnOp::Not, operand: Box::new(operand), span })
            }
            Some(Token::Minus) => {
                let start = self.current_span();
                self.advance();
                let operand = self.parse_unary()?;
                let span = start.merge(operand.span());
                Ok(Expr::Unary { op: UnOp::Neg, operand: Box::new(operand), span })
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        let span = self.current_span();
        match self.peek() {
            Some(Token::IntLit(v)) => {
                let v = *v;
                self.advance();
                Ok(Expr::Int(v, span))
            }
            Some(Token::FloatLit(v)) => {
                let v = *v;
                self.advance();
                Ok(Expr::Float(v, span))
            }
            Some(Token::StringLit(s)) => {
                let s = s.clone();
                self.advance();
                Ok(Expr::Str(s, span))
            }
            Some(Token::True) => {
                self.advance();
                Ok(Expr::Bool(true, span))
            }
            Some(Token::False) => {
                self.advance();
                Ok(Expr::Bool(false, span))
            }
            Some(Token::Null) => {
                self.advance();
                Ok(Expr::Null(span))
            }
            Some(Token::New) => {
                self.advance();
                let class = self.expect_ident()?.node;
                let args = self.parse_args()?;
                Ok(Expr::New { class, args, span })
            }
            Some(Token::This) => {
                self.advance();
                if matches!(self.peek(), Some(Token::Dot)) {
                    self.advance();
                    let name = self.expect_ident()?;
                    if matches!(self.peek(), Some(Token::LParen)) {
                        let args = self.parse_args()?;
                        return Ok(Expr::Call { name: name.node, args, span });
                    }
                    return Ok(Expr::ThisField(name.node, span.merge(name.span)));
                }
                Ok(Expr::This(span))
            }
            Some(Token::Ident) => {
                let name = self.expect_ident()?;
                if matches!(self.peek(), Some(Token::LParen)) {
                    let args = self.parse_args()?;
                    return Ok(Expr::Call { name: name.node, args, span });
                }
                Ok(Expr::Ident(name.node, name.span))
            }
            Some(Token::LParen) => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(other) => Err(CompileError::syntax(
                format!("expected expression, found {other}"),
                span,
            )),
            None => Err(CompileError::syntax("expected expression, found end of file", span)),
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, CompileError> {
        self.expect(&Token::LParen)?;
        let mut args = Vec::new();
        if !matches!(self.peek(), Some(Token::RParen)) {
            loop {
                args.push(self.parse_expr()?);
                if matches!(self.peek(), Some(Token::Comma)) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(&Token::RParen)?;
        Ok(args)
    }

    // --- Token plumbing ---

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|t| &t.node)
    }

    fn peek_ahead(&self, n: usize) -> Option<&Token> {
        self.tokens.get(self.pos + n).map(|t| &t.node)
    }

    fn peek_text(&self) -> Option<&str> {
        self.tokens
            .get(self.pos)
            .map(|t| &self.source[t.span.start..t.span.end])
    }

    fn advance(&mut self) -> Option<&Spanned<Token>> {
        let tok = self.tokens.get(self.pos);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    /// Consume modifiers, returning whether `static` was among them.
    fn skip_modifiers(&mut self) -> bool {
        let mut is_static = false;
        loop {
            match self.peek() {
                Some(Token::Static) => {
                    is_static = true;
                    self.advance();
                }
                Some(
                    Token::Public
                    | Token::Private
                    | Token::Protected
                    | Token::Internal
                    | Token::Sealed
                    | Token::Virtual
                    | Token::Override
                    | Token::Readonly,
                ) => {
                    self.advance();
                }
                _ => return is_static,
            }
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<&Spanned<Token>, CompileError> {
        match self.tokens.get(self.pos) {
            Some(tok) if std::mem::discriminant(&tok.node) == std::mem::discriminant(expected) => {
                self.pos += 1;
                Ok(&self.tokens[self.pos - 1])
            }
            Some(tok) => Err(CompileError::syntax(
                format!("expected {expected}, found {}", tok.node),
                tok.span,
            )),
            None => Err(CompileError::syntax(
                format!("expected {expected}, found end of file"),
                self.eof_span(),
            )),
        }
    }

    fn expect_ident(&mut self) -> Result<Spanned<String>, CompileError> {
        match self.tokens.get(self.pos) {
            Some(tok) if matches!(tok.node, Token::Ident) => {
                let name = self.source[tok.span.start..tok.span.end].to_string();
                let span = tok.span;
                self.pos += 1;
                Ok(Spanned::new(name, span))
            }
            Some(tok) => Err(CompileError::syntax(
                format!("expected identifier, found {}", tok.node),
                tok.span,
            )),
            None => Err(CompileError::syntax(
                "expected identifier, found end of file",
                self.eof_span(),
            )),
        }
    }

    fn current_span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .map(|t| t.span)
            .unwrap_or_else(|| self.eof_span())
    }

    fn eof_span(&self) -> Span {
        let end = self.source.len();
        Span::new(end.saturating_sub(1), end)
    }
}
