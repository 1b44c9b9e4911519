//! Recursive-descent parser for the restricted script grammar.
//!
//! Errors are collected rather than fatal; the parser recovers at statement
//! boundaries so a single typo does not hide everything after it.

use crate::{
    ast::{
        AssignTarget, BinaryOp, Expr, ExprKind, Param, Script, Stmt, StmtKind, UnaryOp,
        VarDeclarator,
    },
    error::{CompileError, CompileErrorTy, Span},
    token::{Token, TokenStream, TokenType},
};

use log::trace;
use string_interner::{StringInterner, Sym};

pub struct Parser<'a> {
    tokens: Vec<Token<'a>>,
    pos: usize,
    errors: Vec<CompileError>,
    pub interner: StringInterner<Sym>,
    eof_span: Span,
}

impl<'a> Parser<'a> {
    pub fn new(source: &'a str) -> Self {
        let tokens: Vec<_> = TokenStream::new(source).collect();
        Self {
            tokens,
            pos: 0,
            errors: Vec::new(),
            interner: StringInterner::new(),
            eof_span: Span::new(source.len(), source.len()),
        }
    }

    /// Parse the whole input. Returns the best-effort AST along with every
    /// error encountered.
    pub fn parse(mut self) -> (Script, StringInterner<Sym>, Vec<CompileError>) {
        trace!("parsing {} tokens", self.tokens.len());

        let mut stmts = Vec::new();
        while self.peek().is_some() {
            match self.stmt() {
                Ok(stmt) => stmts.push(stmt),
                Err(err) => {
                    self.errors.push(err);
                    self.recover();
                }
            }
        }

        (Script { stmts }, self.interner, self.errors)
    }

    fn peek(&self) -> Option<Token<'a>> {
        self.tokens.get(self.pos).copied()
    }

    fn peek_ty(&self) -> Option<TokenType> {
        self.peek().map(|t| t.ty())
    }

    fn next(&mut self) -> Result<Token<'a>, CompileError> {
        match self.tokens.get(self.pos) {
            Some(&tok) => {
                self.pos += 1;
                Ok(tok)
            }
            None => Err(CompileError::new(
                CompileErrorTy::Syntax,
                "unexpected end of input",
                self.eof_span,
            )),
        }
    }

    fn expect(&mut self, ty: TokenType) -> Result<Token<'a>, CompileError> {
        let tok = self.next()?;
        if tok.ty() == ty {
            Ok(tok)
        } else {
            Err(CompileError::new(
                CompileErrorTy::Syntax,
                format!("expected `{}`, found `{}`", ty, tok.source()),
                tok.span(),
            ))
        }
    }

    fn eat(&mut self, ty: TokenType) -> bool {
        if self.peek_ty() == Some(ty) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn intern(&mut self, tok: &Token<'a>) -> Sym {
        self.interner.get_or_intern(tok.source())
    }

    /// Skip to the next statement boundary after an error.
    fn recover(&mut self) {
        while let Some(ty) = self.peek_ty() {
            self.pos += 1;
            if ty == TokenType::Semicolon || ty == TokenType::RightBrace {
                break;
            }
        }
    }

    fn stmt(&mut self) -> Result<Stmt, CompileError> {
        let tok = match self.peek() {
            Some(tok) => tok,
            None => {
                return Err(CompileError::new(
                    CompileErrorTy::Syntax,
                    "unexpected end of input",
                    self.eof_span,
                ))
            }
        };

        match tok.ty() {
            TokenType::Var => self.var_decl(),
            TokenType::If => self.if_stmt(),
            TokenType::Function => self.function_decl(),
            TokenType::Return => self.return_stmt(),
            TokenType::LeftBrace => self.block_stmt(),
            _ => {
                let expr = self.expr()?;
                let span = expr.span;
                self.eat(TokenType::Semicolon);
                Ok(Stmt {
                    kind: StmtKind::Expr(expr),
                    span,
                })
            }
        }
    }

    fn var_decl(&mut self) -> Result<Stmt, CompileError> {
        let start = self.expect(TokenType::Var)?.span();
        let mut decls = Vec::new();

        loop {
            let name_tok = self.expect(TokenType::Ident)?;
            let name = self.intern(&name_tok);
            let span = name_tok.span();

            let init = if self.eat(TokenType::Equal) {
                Some(self.expr()?)
            } else {
                None
            };

            decls.push(VarDeclarator { name, span, init });

            if !self.eat(TokenType::Comma) {
                break;
            }
        }
        self.eat(TokenType::Semicolon);

        let end = decls
            .last()
            .map(|d| d.init.as_ref().map_or(d.span, |init| init.span))
            .unwrap_or(start);

        Ok(Stmt {
            kind: StmtKind::VarDecl(decls),
            span: Span::merge(start, end),
        })
    }

    fn if_stmt(&mut self) -> Result<Stmt, CompileError> {
        let start = self.expect(TokenType::If)?.span();
        self.expect(TokenType::LeftParen)?;
        let cond = self.expr()?;
        self.expect(TokenType::RightParen)?;

        let then = Box::new(self.stmt()?);
        let mut end = then.span;

        let otherwise = if self.eat(TokenType::Else) {
            let stmt = self.stmt()?;
            end = stmt.span;
            Some(Box::new(stmt))
        } else {
            None
        };

        Ok(Stmt {
            kind: StmtKind::If {
                cond,
                then,
                otherwise,
            },
            span: Span::merge(start, end),
        })
    }

    fn function_decl(&mut self) -> Result<Stmt, CompileError> {
        let start = self.expect(TokenType::Function)?.span();
        let name_tok = self.expect(TokenType::Ident)?;
        let name = self.intern(&name_tok);

        self.expect(TokenType::LeftParen)?;
        let params = self.params()?;
        let (body, end) = self.braced_body()?;

        Ok(Stmt {
            kind: StmtKind::FunctionDecl { name, params, body },
            span: Span::merge(start, end),
        })
    }

    /// Comma-separated identifiers up to and including the closing paren.
    fn params(&mut self) -> Result<Vec<Param>, CompileError> {
        let mut params = Vec::new();
        if !self.eat(TokenType::RightParen) {
            loop {
                let tok = self.expect(TokenType::Ident)?;
                params.push(Param {
                    name: self.intern(&tok),
                    span: tok.span(),
                });
                if !self.eat(TokenType::Comma) {
                    break;
                }
            }
            self.expect(TokenType::RightParen)?;
        }
        Ok(params)
    }

    fn braced_body(&mut self) -> Result<(Vec<Stmt>, Span), CompileError> {
        self.expect(TokenType::LeftBrace)?;
        let mut body = Vec::new();
        loop {
            if self.peek_ty() == Some(TokenType::RightBrace) {
                let end = self.next()?.span();
                return Ok((body, end));
            }
            if self.peek().is_none() {
                return Err(CompileError::new(
                    CompileErrorTy::Syntax,
                    "unterminated block",
                    self.eof_span,
                ));
            }
            body.push(self.stmt()?);
        }
    }

    fn return_stmt(&mut self) -> Result<Stmt, CompileError> {
        let start = self.expect(TokenType::Return)?.span();
        let value = match self.peek_ty() {
            Some(TokenType::Semicolon) | Some(TokenType::RightBrace) | None => None,
            _ => Some(self.expr()?),
        };
        let end = value.as_ref().map(|v| v.span).unwrap_or(start);
        self.eat(TokenType::Semicolon);

        Ok(Stmt {
            kind: StmtKind::Return(value),
            span: Span::merge(start, end),
        })
    }

    fn block_stmt(&mut self) -> Result<Stmt, CompileError> {
        let start = match self.peek() {
            Some(tok) => tok.span(),
            None => self.eof_span,
        };
        let (body, end) = self.braced_body()?;
        Ok(Stmt {
            kind: StmtKind::Block(body),
            span: Span::merge(start, end),
        })
    }

    fn expr(&mut self) -> Result<Expr, CompileError> {
        // `[a, b] = ...` is only legal as a whole assignment
        if self.peek_ty() == Some(TokenType::LeftBracket) {
            return self.array_pattern_assign();
        }

        let lhs = self.binary(0)?;

        if self.peek_ty() == Some(TokenType::Equal) {
            let target = match lhs.kind {
                ExprKind::Ident(sym) => AssignTarget::Ident(sym, lhs.span),
                _ => {
                    return Err(CompileError::new(
                        CompileErrorTy::UnsupportedSyntax,
                        "invalid assignment target",
                        lhs.span,
                    ))
                }
            };
            self.next()?;
            let value = self.expr()?;
            let span = Span::merge(lhs.span, value.span);
            return Ok(Expr {
                kind: ExprKind::Assign {
                    target,
                    value: Box::new(value),
                },
                span,
            });
        }

        Ok(lhs)
    }

    fn array_pattern_assign(&mut self) -> Result<Expr, CompileError> {
        let start = self.expect(TokenType::LeftBracket)?.span();
        let mut names = Vec::new();
        loop {
            let tok = self.expect(TokenType::Ident)?;
            names.push(Param {
                name: self.intern(&tok),
                span: tok.span(),
            });
            if !self.eat(TokenType::Comma) {
                break;
            }
        }
        self.expect(TokenType::RightBracket)?;
        self.expect(TokenType::Equal)?;
        let value = self.expr()?;
        let span = Span::merge(start, value.span);

        Ok(Expr {
            kind: ExprKind::Assign {
                target: AssignTarget::ArrayPattern(names),
                value: Box::new(value),
            },
            span,
        })
    }

    fn binary(&mut self, min_prec: u8) -> Result<Expr, CompileError> {
        let mut lhs = self.unary()?;

        while let Some(op) = self.peek_binop() {
            let prec = op.precedence();
            if prec <= min_prec {
                break;
            }
            self.next()?;
            let rhs = self.binary(prec)?;
            let span = Span::merge(lhs.span, rhs.span);
            lhs = Expr {
                kind: ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                span,
            };
        }

        Ok(lhs)
    }

    fn peek_binop(&self) -> Option<BinaryOp> {
        Some(match self.peek_ty()? {
            TokenType::Plus => BinaryOp::Add,
            TokenType::Minus => BinaryOp::Sub,
            TokenType::Star => BinaryOp::Mul,
            TokenType::Divide => BinaryOp::Div,
            TokenType::DoubleStar => BinaryOp::Pow,
            TokenType::LeftCaret => BinaryOp::Lt,
            TokenType::LessThanEqual => BinaryOp::Le,
            TokenType::RightCaret => BinaryOp::Gt,
            TokenType::GreaterThanEqual => BinaryOp::Ge,
            TokenType::IsEqual => BinaryOp::Eq,
            TokenType::IsNotEqual => BinaryOp::Ne,
            TokenType::And => BinaryOp::And,
            TokenType::Or => BinaryOp::Or,
            _ => return None,
        })
    }

    fn unary(&mut self) -> Result<Expr, CompileError> {
        let op = match self.peek_ty() {
            Some(TokenType::Bang) => Some(UnaryOp::Not),
            Some(TokenType::Minus) => Some(UnaryOp::Neg),
            Some(TokenType::Plus) => Some(UnaryOp::Plus),
            _ => None,
        };

        if let Some(op) = op {
            let start = self.next()?.span();
            let expr = self.unary()?;
            let span = Span::merge(start, expr.span);
            return Ok(Expr {
                kind: ExprKind::Unary {
                    op,
                    expr: Box::new(expr),
                },
                span,
            });
        }

        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, CompileError> {
        let mut expr = self.primary()?;

        loop {
            match self.peek_ty() {
                Some(TokenType::Dot) => {
                    self.next()?;
                    let tok = self.expect(TokenType::Ident)?;
                    let prop = self.intern(&tok);
                    let span = Span::merge(expr.span, tok.span());
                    expr = Expr {
                        kind: ExprKind::Member {
                            object: Box::new(expr),
                            prop,
                            prop_span: tok.span(),
                        },
                        span,
                    };
                }
                Some(TokenType::LeftParen) => {
                    self.next()?;
                    let mut args = Vec::new();
                    if !self.eat(TokenType::RightParen) {
                        loop {
                            args.push(self.expr()?);
                            if !self.eat(TokenType::Comma) {
                                break;
                            }
                        }
                        self.expect(TokenType::RightParen)?;
                    }
                    let end = self
                        .tokens
                        .get(self.pos - 1)
                        .map(|t| t.span())
                        .unwrap_or(expr.span);
                    let span = Span::merge(expr.span, end);
                    expr = Expr {
                        kind: ExprKind::Call {
                            callee: Box::new(expr),
                            args,
                        },
                        span,
                    };
                }
                _ => break,
            }
        }

        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, CompileError> {
        let tok = self.next()?;
        let span = tok.span();

        let kind = match tok.ty() {
            TokenType::Number => match tok.float_value() {
                Some(v) => ExprKind::Number(v),
                None => {
                    return Err(CompileError::new(
                        CompileErrorTy::Syntax,
                        format!("invalid number literal `{}`", tok.source()),
                        span,
                    ))
                }
            },
            TokenType::String => ExprKind::String(tok.string_value().unwrap_or("").to_string()),
            TokenType::True => ExprKind::Number(1.0),
            TokenType::False | TokenType::Null => ExprKind::Number(0.0),
            TokenType::Ident => ExprKind::Ident(self.intern(&tok)),
            TokenType::LeftParen => {
                if self.is_arrow_ahead() {
                    return self.arrow(span);
                }
                let inner = self.expr()?;
                self.expect(TokenType::RightParen)?;
                return Ok(inner);
            }
            _ => {
                return Err(CompileError::new(
                    CompileErrorTy::Syntax,
                    format!("unexpected `{}`", tok.source()),
                    span,
                ))
            }
        };

        Ok(Expr { kind, span })
    }

    /// After consuming `(`, look for a matching `)` followed by `=>`.
    fn is_arrow_ahead(&self) -> bool {
        let mut depth = 1usize;
        let mut i = self.pos;
        while let Some(tok) = self.tokens.get(i) {
            match tok.ty() {
                TokenType::LeftParen => depth += 1,
                TokenType::RightParen => {
                    depth -= 1;
                    if depth == 0 {
                        return self.tokens.get(i + 1).map(|t| t.ty())
                            == Some(TokenType::FatArrow);
                    }
                }
                _ => {}
            }
            i += 1;
        }
        false
    }

    /// Parse `params) => body`; the opening paren is already consumed.
    fn arrow(&mut self, start: Span) -> Result<Expr, CompileError> {
        let params = self.params()?;
        self.expect(TokenType::FatArrow)?;

        let (body, end) = if self.peek_ty() == Some(TokenType::LeftBrace) {
            self.braced_body()?
        } else {
            let expr = self.expr()?;
            let span = expr.span;
            (
                vec![Stmt {
                    kind: StmtKind::Expr(expr),
                    span,
                }],
                span,
            )
        };

        Ok(Expr {
            kind: ExprKind::Arrow { params, body },
            span: Span::merge(start, end),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> Script {
        let (script, _, errors) = Parser::new(src).parse();
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
        script
    }

    fn parse_err(src: &str) -> Vec<CompileError> {
        let (_, _, errors) = Parser::new(src).parse();
        errors
    }

    #[test]
    fn var_decls() {
        let script = parse_ok("var a = 1, b; var c = a + b;");
        assert_eq!(script.stmts.len(), 2);
        match &script.stmts[0].kind {
            StmtKind::VarDecl(decls) => {
                assert_eq!(decls.len(), 2);
                assert!(decls[0].init.is_some());
                assert!(decls[1].init.is_none());
            }
            other => panic!("expected var decl, got {:?}", other),
        }
    }

    #[test]
    fn precedence() {
        let script = parse_ok("x = 1 + 2 * 3;");
        match &script.stmts[0].kind {
            StmtKind::Expr(Expr {
                kind: ExprKind::Assign { value, .. },
                ..
            }) => match &value.kind {
                ExprKind::Binary { op, rhs, .. } => {
                    assert_eq!(*op, BinaryOp::Add);
                    assert!(matches!(
                        rhs.kind,
                        ExprKind::Binary {
                            op: BinaryOp::Mul,
                            ..
                        }
                    ));
                }
                other => panic!("expected binary, got {:?}", other),
            },
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn role_subscription() {
        let script = parse_ok("var b = roles.button(); b.down.sub(() => { });");
        assert_eq!(script.stmts.len(), 2);
        match &script.stmts[1].kind {
            StmtKind::Expr(Expr {
                kind: ExprKind::Call { args, .. },
                ..
            }) => {
                assert!(matches!(args[0].kind, ExprKind::Arrow { .. }));
            }
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn array_pattern() {
        let script = parse_ok("[x, y] = acc.forces.read();");
        match &script.stmts[0].kind {
            StmtKind::Expr(Expr {
                kind:
                    ExprKind::Assign {
                        target: AssignTarget::ArrayPattern(names),
                        ..
                    },
                ..
            }) => assert_eq!(names.len(), 2),
            other => panic!("expected array pattern assign, got {:?}", other),
        }
    }

    #[test]
    fn parenthesized_is_not_arrow() {
        parse_ok("var x = (1 + 2) * 3;");
    }

    #[test]
    fn recovers_at_statement_boundary() {
        let errors = parse_err("var = 1; var ok = 2; +");
        assert!(!errors.is_empty());
        let (script, _, _) = Parser::new("var = 1; var ok = 2;").parse();
        assert_eq!(script.stmts.len(), 1);
    }

    #[test]
    fn if_else() {
        let script = parse_ok("if (x < 1) { y = 1; } else y = 2;");
        assert!(matches!(
            script.stmts[0].kind,
            StmtKind::If {
                otherwise: Some(_),
                ..
            }
        ));
    }
}
