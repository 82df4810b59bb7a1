//! Recursive-descent parser for host kernels.
//!
//! ```text
//! program := kernel*
//! kernel  := "kernel" IDENT "(" (param ("," param)* ","?)? ")" block
//! param   := IDENT ":" type
//! type    := "buffer" "<" IDENT ">" | IDENT
//! block   := "{" stmt* "}"
//! stmt    := "let" IDENT "=" expr ";"
//!          | IDENT "=" expr ";"
//!          | IDENT "[" expr "]" "=" expr ";"
//!          | "if" expr block ("else" (block | if))?
//!          | "for" IDENT "in" expr ".." expr block
//! ```
//!
//! Expressions use the usual precedence: `||`, `&&`, comparisons, additive,
//! multiplicative, unary, postfix. Nesting of blocks and expressions is capped
//! at [`MAX_NESTING`] levels.

use super::diagnostics::{Diagnostic, Span};
use super::lexer::Token;
use crate::gpu::structs::ScalarType;

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub kernels: Vec<KernelDecl>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KernelDecl {
    pub name: String,
    pub span: Span,
    pub params: Vec<ParamDecl>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeExpr {
    Scalar(ScalarType),
    Buffer(ScalarType),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamDecl {
    pub name: String,
    pub ty: TypeExpr,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Let {
        name: String,
        value: Expr,
        span: Span,
    },
    Assign {
        name: String,
        value: Expr,
        span: Span,
    },
    Store {
        buffer: String,
        index: Expr,
        value: Expr,
        span: Span,
    },
    If {
        cond: Expr,
        then: Vec<Stmt>,
        otherwise: Vec<Stmt>,
    },
    For {
        var: String,
        start: Expr,
        end: Expr,
        body: Vec<Stmt>,
        span: Span,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Int(i64),
    UInt(u32),
    Float(f32),
    Bool(bool),
    Var(String),
    Index(String, Box<Expr>),
    Call(String, Vec<Expr>),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

pub fn scalar_type(name: &str) -> Option<ScalarType> {
    match name {
        "f32" => Some(ScalarType::F32),
        "i32" => Some(ScalarType::I32),
        "u32" => Some(ScalarType::U32),
        "bool" => Some(ScalarType::Bool),
        _ => None,
    }
}

type PResult<T> = Result<T, Diagnostic>;

pub const MAX_NESTING: usize = 256;

struct Parser<'a> {
    tokens: &'a [(Token, Span)],
    pos: usize,
    eof: Span,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_at(&self, n: usize) -> Option<&Token> {
        self.tokens.get(self.pos + n).map(|(t, _)| t)
    }

    fn span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .map(|(_, s)| s.clone())
            .unwrap_or_else(|| self.eof.clone())
    }

    fn prev_end(&self) -> usize {
        if self.pos == 0 {
            0
        } else {
            self.tokens[self.pos - 1].1.end
        }
    }

    fn bump(&mut self) -> Option<(Token, Span)> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn error_here(&self, expected: &str) -> Diagnostic {
        let found = match self.peek() {
            Some(tok) => tok.to_string(),
            None => "end of input".to_string(),
        };
        Diagnostic::new(format!("expected {expected}, found {found}"), self.span())
    }

    fn eat(&mut self, tok: &Token) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Token) -> PResult<Span> {
        if self.peek() == Some(&tok) {
            let span = self.span();
            self.pos += 1;
            Ok(span)
        } else {
            Err(self.error_here(&tok.to_string()))
        }
    }

    fn too_deep(&self, what: &str) -> Diagnostic {
        Diagnostic::new(format!("{what} nested too deeply"), self.span())
    }

    /// Run `f` one nesting level down.
    fn nested<T>(&mut self, what: &str, f: impl FnOnce(&mut Self) -> PResult<T>) -> PResult<T> {
        if self.depth >= MAX_NESTING {
            return Err(self.too_deep(what));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn ident(&mut self) -> PResult<(String, Span)> {
        match self.peek() {
            Some(Token::Ident(_)) => match self.bump() {
                Some((Token::Ident(name), span)) => Ok((name, span)),
                _ => Err(self.error_here("identifier")),
            },
            _ => Err(self.error_here("identifier")),
        }
    }

    fn program(&mut self) -> PResult<Program> {
        let mut kernels = Vec::new();
        while self.peek().is_some() {
            kernels.push(self.kernel()?);
        }
        Ok(Program { kernels })
    }

    fn kernel(&mut self) -> PResult<KernelDecl> {
        if self.peek() != Some(&Token::Kernel) {
            return Err(self.error_here("`kernel`"));
        }
        self.pos += 1;
        let (name, span) = self.ident()?;
        self.expect(Token::LParen)?;

        let mut params = Vec::new();
        while self.peek() != Some(&Token::RParen) {
            params.push(self.param()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(Token::RParen)?;
        let body = self.block()?;

        Ok(KernelDecl {
            name,
            span,
            params,
            body,
        })
    }

    fn param(&mut self) -> PResult<ParamDecl> {
        let (name, start) = self.ident()?;
        self.expect(Token::Colon)?;
        let ty = self.type_expr()?;
        Ok(ParamDecl {
            name,
            ty,
            span: start.start..self.prev_end(),
        })
    }

    fn type_expr(&mut self) -> PResult<TypeExpr> {
        if self.eat(&Token::Buffer) {
            self.expect(Token::Lt)?;
            let (elem, span) = self.ident()?;
            let ty = match scalar_type(&elem) {
                Some(ScalarType::Bool) | None => {
                    return Err(Diagnostic::new(
                        format!("`{elem}` is not a buffer element type (expected f32, i32 or u32)"),
                        span,
                    ))
                }
                Some(ty) => ty,
            };
            self.expect(Token::Gt)?;
            return Ok(TypeExpr::Buffer(ty));
        }

        let (name, span) = self.ident()?;
        scalar_type(&name)
            .map(TypeExpr::Scalar)
            .ok_or_else(|| Diagnostic::new(format!("unknown type `{name}`"), span))
    }

    fn block(&mut self) -> PResult<Vec<Stmt>> {
        self.nested("block", Self::block_body)
    }

    fn block_body(&mut self) -> PResult<Vec<Stmt>> {
        self.expect(Token::LBrace)?;
        let mut stmts = Vec::new();
        while !self.eat(&Token::RBrace) {
            if self.peek().is_none() {
                return Err(self.error_here("`}`"));
            }
            stmts.push(self.stmt()?);
        }
        Ok(stmts)
    }

    fn stmt(&mut self) -> PResult<Stmt> {
        let start = self.span().start;
        match self.peek() {
            Some(Token::Let) => {
                self.pos += 1;
                let (name, _) = self.ident()?;
                self.expect(Token::Assign)?;
                let value = self.expr()?;
                self.expect(Token::Semi)?;
                Ok(Stmt::Let {
                    name,
                    value,
                    span: start..self.prev_end(),
                })
            }
            Some(Token::If) => self.if_stmt(),
            Some(Token::For) => {
                self.pos += 1;
                let (var, _) = self.ident()?;
                self.expect(Token::In)?;
                let range_start = self.expr()?;
                self.expect(Token::DotDot)?;
                let range_end = self.expr()?;
                let body = self.block()?;
                Ok(Stmt::For {
                    var,
                    start: range_start,
                    end: range_end,
                    body,
                    span: start..self.prev_end(),
                })
            }
            Some(Token::Ident(_)) if self.peek_at(1) == Some(&Token::LBracket) => {
                let (buffer, _) = self.ident()?;
                self.expect(Token::LBracket)?;
                let index = self.expr()?;
                self.expect(Token::RBracket)?;
                self.expect(Token::Assign)?;
                let value = self.expr()?;
                self.expect(Token::Semi)?;
                Ok(Stmt::Store {
                    buffer,
                    index,
                    value,
                    span: start..self.prev_end(),
                })
            }
            Some(Token::Ident(_)) => {
                let (name, _) = self.ident()?;
                self.expect(Token::Assign)?;
                let value = self.expr()?;
                self.expect(Token::Semi)?;
                Ok(Stmt::Assign {
                    name,
                    value,
                    span: start..self.prev_end(),
                })
            }
            _ => Err(self.error_here("statement")),
        }
    }

    fn if_stmt(&mut self) -> PResult<Stmt> {
        self.expect(Token::If)?;
        let cond = self.expr()?;
        let then = self.block()?;
        let otherwise = if self.eat(&Token::Else) {
            if self.peek() == Some(&Token::If) {
                vec![self.nested("block", Self::if_stmt)?]
            } else {
                self.block()?
            }
        } else {
            Vec::new()
        };
        Ok(Stmt::If {
            cond,
            then,
            otherwise,
        })
    }

    fn expr(&mut self) -> PResult<Expr> {
        self.nested("expression", |p| p.binary(0))
    }

    fn binary_op(tok: &Token) -> Option<(BinOp, u8)> {
        Some(match tok {
            Token::OrOr => (BinOp::Or, 0),
            Token::AndAnd => (BinOp::And, 1),
            Token::EqEq => (BinOp::Eq, 2),
            Token::NotEq => (BinOp::Ne, 2),
            Token::Lt => (BinOp::Lt, 2),
            Token::Le => (BinOp::Le, 2),
            Token::Gt => (BinOp::Gt, 2),
            Token::Ge => (BinOp::Ge, 2),
            Token::Plus => (BinOp::Add, 3),
            Token::Minus => (BinOp::Sub, 3),
            Token::Star => (BinOp::Mul, 4),
            Token::Slash => (BinOp::Div, 4),
            Token::Percent => (BinOp::Rem, 4),
            _ => return None,
        })
    }

    /// Precedence climbing; every level is left associative.
    fn binary(&mut self, min_prec: u8) -> PResult<Expr> {
        let mut lhs = self.unary()?;
        // Operator chains nest to the left and count against the same limit.
        let mut chain = 0;
        while let Some((op, prec)) = self.peek().and_then(Self::binary_op) {
            if prec < min_prec {
                break;
            }
            chain += 1;
            if self.depth + chain > MAX_NESTING {
                return Err(self.too_deep("expression"));
            }
            self.pos += 1;
            let rhs = self.binary(prec + 1)?;
            let span = lhs.span.start..rhs.span.end;
            lhs = Expr {
                kind: ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)),
                span,
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> PResult<Expr> {
        let op = match self.peek() {
            Some(Token::Minus) => UnOp::Neg,
            Some(Token::Bang) => UnOp::Not,
            _ => return self.primary(),
        };
        let start = self.span().start;
        self.pos += 1;
        let inner = self.nested("expression", Self::unary)?;
        let span = start..inner.span.end;
        Ok(Expr {
            kind: ExprKind::Unary(op, Box::new(inner)),
            span,
        })
    }

    fn primary(&mut self) -> PResult<Expr> {
        let span = self.span();
        let kind = match self.peek().cloned() {
            Some(Token::Int(v)) => {
                self.pos += 1;
                ExprKind::Int(v)
            }
            Some(Token::UInt(v)) => {
                self.pos += 1;
                ExprKind::UInt(v)
            }
            Some(Token::Float(v)) => {
                self.pos += 1;
                ExprKind::Float(v)
            }
            Some(Token::True) => {
                self.pos += 1;
                ExprKind::Bool(true)
            }
            Some(Token::False) => {
                self.pos += 1;
                ExprKind::Bool(false)
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                return Ok(Expr {
                    kind: inner.kind,
                    span: span.start..self.prev_end(),
                });
            }
            Some(Token::Ident(name)) => {
                self.pos += 1;
                if self.eat(&Token::LParen) {
                    let mut args = Vec::new();
                    while self.peek() != Some(&Token::RParen) {
                        args.push(self.expr()?);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                    self.expect(Token::RParen)?;
                    ExprKind::Call(name, args)
                } else if self.eat(&Token::LBracket) {
                    let index = self.expr()?;
                    self.expect(Token::RBracket)?;
                    ExprKind::Index(name, Box::new(index))
                } else {
                    ExprKind::Var(name)
                }
            }
            _ => return Err(self.error_here("expression")),
        };

        Ok(Expr {
            kind,
            span: span.start..self.prev_end(),
        })
    }
}

pub fn parse(src: &str, tokens: &[(Token, Span)]) -> Result<Program, Diagnostic> {
    let mut parser = Parser {
        tokens,
        pos: 0,
        eof: src.len()..src.len(),
        depth: 0,
    };
    parser.program()
}
