//! Type checking and lowering of parsed kernels.
//!
//! Typing is strict: no implicit conversions between `f32`, `i32`, `u32`
//! and `bool`. The only flexibility is that an unsuffixed integer literal
//! takes the type its context expects, defaulting to `i32`.

use std::collections::HashMap;

use super::diagnostics::{Diagnostic, Span};
use super::parser::{BinOp, Expr, ExprKind, KernelDecl, Program, Stmt, TypeExpr, UnOp};
use crate::gpu::structs::{EntryPoint, ParamKind, ScalarType, ScalarValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub fn index(&self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }
}

/// Thread-identity values available without arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    /// Row-major linear index over the whole launch.
    GlobalLinear,
    Global(Axis),
    Local(Axis),
    Block(Axis),
    GlobalSize(Axis),
    BlockSize(Axis),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intrinsic {
    Min,
    Max,
    Abs,
    Sqrt,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Ir {
    Const(ScalarValue),
    Local(usize),
    Builtin(Builtin),
    Load {
        param: usize,
        index: Box<Ir>,
    },
    Len(usize),
    Unary(UnOp, Box<Ir>),
    Binary(BinOp, Box<Ir>, Box<Ir>),
    Call(Intrinsic, Vec<Ir>),
    Cast(ScalarType, Box<Ir>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum IrStmt {
    Set(usize, Ir),
    Store {
        param: usize,
        index: Ir,
        value: Ir,
    },
    If {
        cond: Ir,
        then: Vec<IrStmt>,
        otherwise: Vec<IrStmt>,
    },
    For {
        var: usize,
        ty: ScalarType,
        start: Ir,
        end: Ir,
        body: Vec<IrStmt>,
    },
}

/// A kernel ready for the interpreter.
#[derive(Debug, Clone)]
pub struct CompiledKernel {
    pub name: String,
    pub params: Vec<ParamKind>,
    /// Element type of each buffer parameter, `None` for scalars.
    pub elements: Vec<Option<ScalarType>>,
    /// Local slot receiving each scalar parameter.
    pub scalar_slots: Vec<(usize, usize)>,
    pub local_count: usize,
    pub body: Vec<IrStmt>,
}

impl CompiledKernel {
    pub fn entry_point(&self) -> EntryPoint {
        EntryPoint::new(&self.name, &self.params)
    }
}

type CResult<T> = Result<T, Diagnostic>;

#[derive(Clone, Copy)]
enum Binding {
    Local(usize, ScalarType),
    Buffer(usize, ScalarType),
}

struct Checker {
    scopes: Vec<HashMap<String, Binding>>,
    next_slot: usize,
    max_slot: usize,
}

fn builtin(name: &str) -> Option<Builtin> {
    let axis = |suffix: &str| match suffix {
        "x" => Some(Axis::X),
        "y" => Some(Axis::Y),
        "z" => Some(Axis::Z),
        _ => None,
    };
    match name {
        "gid" => return Some(Builtin::GlobalLinear),
        "lid" => return Some(Builtin::Local(Axis::X)),
        "bid" => return Some(Builtin::Block(Axis::X)),
        _ => {}
    }
    let (base, suffix) = name.rsplit_once('_')?;
    let axis = axis(suffix)?;
    Some(match base {
        "gid" => Builtin::Global(axis),
        "lid" => Builtin::Local(axis),
        "bid" => Builtin::Block(axis),
        "gsize" => Builtin::GlobalSize(axis),
        "bsize" => Builtin::BlockSize(axis),
        _ => return None,
    })
}

fn cast_target(name: &str) -> Option<ScalarType> {
    match name {
        "f32" => Some(ScalarType::F32),
        "i32" => Some(ScalarType::I32),
        "u32" => Some(ScalarType::U32),
        _ => None,
    }
}

fn is_numeric(ty: ScalarType) -> bool {
    ty != ScalarType::Bool
}

fn is_integer(ty: ScalarType) -> bool {
    matches!(ty, ScalarType::I32 | ScalarType::U32)
}

/// An integer literal, possibly negated, whose type is still open.
fn is_open_literal(expr: &Expr) -> bool {
    match &expr.kind {
        ExprKind::Int(_) => true,
        ExprKind::Unary(UnOp::Neg, inner) => is_open_literal(inner),
        _ => false,
    }
}

fn mismatch(span: Span, expected: ScalarType, found: ScalarType) -> Diagnostic {
    Diagnostic::new(
        format!("mismatched types: expected `{expected}`, found `{found}`"),
        span,
    )
}

impl Checker {
    fn new() -> Self {
        Self {
            scopes: vec![HashMap::new()],
            next_slot: 0,
            max_slot: 0,
        }
    }

    fn lookup(&self, name: &str) -> Option<Binding> {
        self.scopes.iter().rev().find_map(|s| s.get(name).copied())
    }

    fn declare_local(&mut self, name: &str, ty: ScalarType) -> usize {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.max_slot = self.max_slot.max(self.next_slot);
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), Binding::Local(slot, ty));
        }
        slot
    }

    fn scoped<T>(&mut self, f: impl FnOnce(&mut Self) -> CResult<T>) -> CResult<T> {
        let mark = self.next_slot;
        self.scopes.push(HashMap::new());
        let out = f(self);
        self.scopes.pop();
        self.next_slot = mark;
        out
    }

    fn block(&mut self, stmts: &[Stmt]) -> CResult<Vec<IrStmt>> {
        self.scoped(|c| stmts.iter().map(|s| c.stmt(s)).collect())
    }

    fn stmt(&mut self, stmt: &Stmt) -> CResult<IrStmt> {
        match stmt {
            Stmt::Let { name, value, .. } => {
                let (ir, ty) = self.expr(value, None)?;
                let slot = self.declare_local(name, ty);
                Ok(IrStmt::Set(slot, ir))
            }
            Stmt::Assign { name, value, span } => match self.lookup(name) {
                Some(Binding::Local(slot, ty)) => {
                    let ir = self.expect(value, ty)?;
                    Ok(IrStmt::Set(slot, ir))
                }
                Some(Binding::Buffer(..)) => Err(Diagnostic::new(
                    format!("cannot assign to buffer `{name}`; index it instead"),
                    span.clone(),
                )),
                None => Err(Diagnostic::new(
                    format!("unknown variable `{name}`"),
                    span.clone(),
                )),
            },
            Stmt::Store {
                buffer,
                index,
                value,
                span,
            } => {
                let (param, elem) = self.buffer(buffer, span.clone())?;
                let index = self.index(index)?;
                let value = self.expect(value, elem)?;
                Ok(IrStmt::Store {
                    param,
                    index,
                    value,
                })
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                let cond = self.expect(cond, ScalarType::Bool)?;
                let then = self.block(then)?;
                let otherwise = self.block(otherwise)?;
                Ok(IrStmt::If {
                    cond,
                    then,
                    otherwise,
                })
            }
            Stmt::For {
                var,
                start,
                end,
                body,
                ..
            } => {
                let (start_ir, end_ir, ty) = self.pair(start, end, None)?;
                if !is_integer(ty) {
                    return Err(Diagnostic::new(
                        format!("loop bounds must be integers, found `{ty}`"),
                        start.span.start..end.span.end,
                    ));
                }
                self.scoped(|c| {
                    let slot = c.declare_local(var, ty);
                    let body = body.iter().map(|s| c.stmt(s)).collect::<CResult<_>>()?;
                    Ok(IrStmt::For {
                        var: slot,
                        ty,
                        start: start_ir,
                        end: end_ir,
                        body,
                    })
                })
            }
        }
    }

    fn buffer(&self, name: &str, span: Span) -> CResult<(usize, ScalarType)> {
        match self.lookup(name) {
            Some(Binding::Buffer(param, elem)) => Ok((param, elem)),
            Some(Binding::Local(..)) => Err(Diagnostic::new(
                format!("`{name}` is not a buffer"),
                span,
            )),
            None => Err(Diagnostic::new(format!("unknown buffer `{name}`"), span)),
        }
    }

    fn index(&mut self, index: &Expr) -> CResult<Ir> {
        let (ir, ty) = self.expr(index, Some(ScalarType::U32))?;
        if !is_integer(ty) {
            return Err(Diagnostic::new(
                format!("buffer index must be an integer, found `{ty}`"),
                index.span.clone(),
            ));
        }
        Ok(ir)
    }

    fn expect(&mut self, expr: &Expr, ty: ScalarType) -> CResult<Ir> {
        let (ir, found) = self.expr(expr, Some(ty))?;
        if found != ty {
            return Err(mismatch(expr.span.clone(), ty, found));
        }
        Ok(ir)
    }

    /// Check two operands that must share a type. An open literal on the left
    /// adopts the right operand's type.
    fn pair(
        &mut self,
        lhs: &Expr,
        rhs: &Expr,
        hint: Option<ScalarType>,
    ) -> CResult<(Ir, Ir, ScalarType)> {
        if is_open_literal(lhs) && !is_open_literal(rhs) {
            let (r, ty) = self.expr(rhs, hint)?;
            let l = self.expect(lhs, ty)?;
            return Ok((l, r, ty));
        }
        let (l, ty) = self.expr(lhs, hint)?;
        let r = self.expect(rhs, ty)?;
        Ok((l, r, ty))
    }

    fn literal(value: i64, hint: Option<ScalarType>, span: Span) -> CResult<(Ir, ScalarType)> {
        let ty = match hint {
            Some(ScalarType::Bool) | None => ScalarType::I32,
            Some(ty) => ty,
        };
        let value = match ty {
            ScalarType::F32 => ScalarValue::F32(value as f32),
            ScalarType::U32 => ScalarValue::U32(u32::try_from(value).map_err(|_| {
                Diagnostic::new(format!("literal `{value}` does not fit in `u32`"), span.clone())
            })?),
            _ => ScalarValue::I32(i32::try_from(value).map_err(|_| {
                Diagnostic::new(format!("literal `{value}` does not fit in `i32`"), span.clone())
            })?),
        };
        Ok((Ir::Const(value), ty))
    }

    fn expr(&mut self, expr: &Expr, hint: Option<ScalarType>) -> CResult<(Ir, ScalarType)> {
        let span = expr.span.clone();
        match &expr.kind {
            ExprKind::Int(v) => Self::literal(*v, hint, span),
            ExprKind::UInt(v) => Ok((Ir::Const(ScalarValue::U32(*v)), ScalarType::U32)),
            ExprKind::Float(v) => Ok((Ir::Const(ScalarValue::F32(*v)), ScalarType::F32)),
            ExprKind::Bool(v) => Ok((Ir::Const(ScalarValue::Bool(*v)), ScalarType::Bool)),
            ExprKind::Var(name) => match self.lookup(name) {
                Some(Binding::Local(slot, ty)) => Ok((Ir::Local(slot), ty)),
                Some(Binding::Buffer(..)) => Err(Diagnostic::new(
                    format!("buffer `{name}` cannot be used as a value"),
                    span,
                )),
                None => match builtin(name) {
                    Some(b) => Ok((Ir::Builtin(b), ScalarType::U32)),
                    None => Err(Diagnostic::new(format!("unknown variable `{name}`"), span)),
                },
            },
            ExprKind::Index(name, index) => {
                let (param, elem) = self.buffer(name, span)?;
                let index = self.index(index)?;
                Ok((
                    Ir::Load {
                        param,
                        index: Box::new(index),
                    },
                    elem,
                ))
            }
            ExprKind::Unary(UnOp::Neg, inner) => {
                if let ExprKind::Int(v) = inner.kind {
                    return Self::literal(-v, hint, span);
                }
                let (ir, ty) = self.expr(inner, hint)?;
                if !matches!(ty, ScalarType::I32 | ScalarType::F32) {
                    return Err(Diagnostic::new(
                        format!("cannot negate a value of type `{ty}`"),
                        span,
                    ));
                }
                Ok((Ir::Unary(UnOp::Neg, Box::new(ir)), ty))
            }
            ExprKind::Unary(UnOp::Not, inner) => {
                let ir = self.expect(inner, ScalarType::Bool)?;
                Ok((Ir::Unary(UnOp::Not, Box::new(ir)), ScalarType::Bool))
            }
            ExprKind::Binary(op, lhs, rhs) => self.binary(*op, lhs, rhs, hint, span),
            ExprKind::Call(name, args) => self.call(name, args, hint, span),
        }
    }

    fn binary(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        hint: Option<ScalarType>,
        span: Span,
    ) -> CResult<(Ir, ScalarType)> {
        let result = match op {
            BinOp::And | BinOp::Or => {
                let l = self.expect(lhs, ScalarType::Bool)?;
                let r = self.expect(rhs, ScalarType::Bool)?;
                return Ok((
                    Ir::Binary(op, Box::new(l), Box::new(r)),
                    ScalarType::Bool,
                ));
            }
            BinOp::Eq | BinOp::Ne => {
                let (l, r, _) = self.pair(lhs, rhs, None)?;
                (l, r, ScalarType::Bool)
            }
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let (l, r, ty) = self.pair(lhs, rhs, None)?;
                if !is_numeric(ty) {
                    return Err(Diagnostic::new(
                        format!("`{}` is not defined for `{ty}`", op.symbol()),
                        span,
                    ));
                }
                (l, r, ScalarType::Bool)
            }
            _ => {
                let (l, r, ty) = self.pair(lhs, rhs, hint)?;
                if !is_numeric(ty) {
                    return Err(Diagnostic::new(
                        format!("`{}` is not defined for `{ty}`", op.symbol()),
                        span,
                    ));
                }
                (l, r, ty)
            }
        };
        let (l, r, ty) = result;
        Ok((Ir::Binary(op, Box::new(l), Box::new(r)), ty))
    }

    fn call(
        &mut self,
        name: &str,
        args: &[Expr],
        hint: Option<ScalarType>,
        span: Span,
    ) -> CResult<(Ir, ScalarType)> {
        let arity = |n: usize| {
            if args.len() == n {
                Ok(())
            } else {
                Err(Diagnostic::new(
                    format!("`{name}` takes {n} argument(s), {} given", args.len()),
                    span.clone(),
                ))
            }
        };

        if let Some(target) = cast_target(name) {
            arity(1)?;
            let (ir, _) = self.expr(&args[0], Some(target))?;
            return Ok((Ir::Cast(target, Box::new(ir)), target));
        }

        match name {
            "len" => {
                arity(1)?;
                let ExprKind::Var(buffer) = &args[0].kind else {
                    return Err(Diagnostic::new(
                        "`len` expects a buffer parameter",
                        args[0].span.clone(),
                    ));
                };
                let (param, _) = self.buffer(buffer, args[0].span.clone())?;
                Ok((Ir::Len(param), ScalarType::U32))
            }
            "min" | "max" => {
                arity(2)?;
                let (l, r, ty) = self.pair(&args[0], &args[1], hint)?;
                if !is_numeric(ty) {
                    return Err(Diagnostic::new(
                        format!("`{name}` is not defined for `{ty}`"),
                        span,
                    ));
                }
                let f = if name == "min" {
                    Intrinsic::Min
                } else {
                    Intrinsic::Max
                };
                Ok((Ir::Call(f, vec![l, r]), ty))
            }
            "abs" => {
                arity(1)?;
                let (ir, ty) = self.expr(&args[0], hint)?;
                if !matches!(ty, ScalarType::I32 | ScalarType::F32) {
                    return Err(Diagnostic::new(
                        format!("`abs` is not defined for `{ty}`"),
                        span,
                    ));
                }
                Ok((Ir::Call(Intrinsic::Abs, vec![ir]), ty))
            }
            "sqrt" => {
                arity(1)?;
                let ir = self.expect(&args[0], ScalarType::F32)?;
                Ok((Ir::Call(Intrinsic::Sqrt, vec![ir]), ScalarType::F32))
            }
            _ if builtin(name).is_some() => Err(Diagnostic::new(
                format!("`{name}` is a builtin value, not a function"),
                span,
            )),
            _ => Err(Diagnostic::new(format!("unknown function `{name}`"), span)),
        }
    }
}

fn compile_kernel(decl: &KernelDecl) -> CResult<CompiledKernel> {
    let mut checker = Checker::new();
    let mut params = Vec::with_capacity(decl.params.len());
    let mut elements = Vec::with_capacity(decl.params.len());
    let mut scalar_slots = Vec::new();

    for (index, param) in decl.params.iter().enumerate() {
        if checker.scopes[0].contains_key(&param.name) {
            return Err(Diagnostic::new(
                format!("parameter `{}` declared twice", param.name),
                param.span.clone(),
            ));
        }
        match param.ty {
            TypeExpr::Buffer(elem) => {
                checker.scopes[0].insert(param.name.clone(), Binding::Buffer(index, elem));
                params.push(ParamKind::Buffer);
                elements.push(Some(elem));
            }
            TypeExpr::Scalar(ty) => {
                let slot = checker.declare_local(&param.name, ty);
                scalar_slots.push((index, slot));
                params.push(ParamKind::Scalar(ty));
                elements.push(None);
            }
        }
    }

    let body = checker.block(&decl.body)?;
    Ok(CompiledKernel {
        name: decl.name.clone(),
        params,
        elements,
        scalar_slots,
        local_count: checker.max_slot,
        body,
    })
}

/// Check and lower every kernel, reporting one diagnostic per failing kernel.
pub fn compile(program: &Program) -> Result<Vec<CompiledKernel>, Vec<Diagnostic>> {
    let mut kernels: Vec<CompiledKernel> = Vec::new();
    let mut errors = Vec::new();

    for decl in &program.kernels {
        if kernels.iter().any(|k| k.name == decl.name) {
            errors.push(Diagnostic::new(
                format!("kernel `{}` defined twice", decl.name),
                decl.span.clone(),
            ));
            continue;
        }
        match compile_kernel(decl) {
            Ok(kernel) => kernels.push(kernel),
            Err(diag) => errors.push(diag),
        }
    }

    if errors.is_empty() {
        Ok(kernels)
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::cpu::lexer::lex;
    use crate::gpu::cpu::parser::parse;

    fn compile_src(src: &str) -> Result<Vec<CompiledKernel>, Vec<Diagnostic>> {
        let tokens = lex(src).unwrap();
        let program = parse(src, &tokens).unwrap();
        compile(&program)
    }

    #[test]
    fn literals_adopt_context_type() {
        let kernels = compile_src(
            "kernel k(o: buffer<f32>, n: u32) {\n\
             if gid < n { o[gid] = 2 * o[gid] + 1; }\n\
             }",
        )
        .unwrap();
        assert_eq!(kernels[0].params, vec![ParamKind::Buffer, ParamKind::Scalar(ScalarType::U32)]);
        assert_eq!(kernels[0].scalar_slots, vec![(1, 0)]);
    }

    #[test]
    fn rejects_mixed_arithmetic() {
        let errs = compile_src("kernel k(o: buffer<f32>, a: i32) { o[0] = o[0] * a; }").unwrap_err();
        assert_eq!(errs[0].message, "mismatched types: expected `f32`, found `i32`");
    }

    #[test]
    fn rejects_negative_unsigned_literal() {
        let errs = compile_src("kernel k(o: buffer<u32>) { o[0] = -1; }").unwrap_err();
        assert!(errs[0].message.contains("does not fit in `u32`"));
    }

    #[test]
    fn scopes_release_local_slots() {
        let kernels = compile_src(
            "kernel k(o: buffer<i32>) {\n\
             let a = 1;\n\
             for i in 0..4 { let t = i * 2; o[i] = t + a; }\n\
             if true { let u = 3; o[0] = u; }\n\
             }",
        )
        .unwrap();
        // a, i, t live together at most; u reuses i's slot.
        assert_eq!(kernels[0].local_count, 3);
    }

    #[test]
    fn reports_unknown_names_and_duplicates() {
        let errs = compile_src(
            "kernel a(o: buffer<i32>) { o[0] = missing; }\n\
             kernel b(x: i32, x: i32) {}\n\
             kernel b() {}",
        )
        .unwrap_err();
        let messages: Vec<_> = errs.iter().map(|d| d.message.as_str()).collect();
        assert_eq!(
            messages,
            vec![
                "unknown variable `missing`",
                "parameter `x` declared twice",
            ]
        );
    }
}
