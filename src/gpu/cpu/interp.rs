//! Tree-walking evaluator for lowered kernels.

use super::compiler::{Builtin, CompiledKernel, Intrinsic, Ir, IrStmt};
use super::memory::HostMemory;
use super::parser::{BinOp, UnOp};
use crate::gpu::structs::{LaunchShape, ScalarType, ScalarValue};

/// Buffer elements are 32 bits wide.
pub const ELEMENT_BYTES: u64 = 4;

/// A buffer argument as the kernel sees it.
pub struct BufferView<'a> {
    pub memory: &'a HostMemory,
    pub offset: u64,
    pub len: u32,
}

/// Resolved arguments of one launch, indexed by parameter position.
pub struct Bindings<'a> {
    pub buffers: Vec<Option<BufferView<'a>>>,
    pub scalars: Vec<Option<ScalarValue>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault(pub String);

type Run<T> = Result<T, Fault>;

#[derive(Clone, Copy, Default)]
struct ThreadIds {
    global: [u32; 3],
    local: [u32; 3],
    block: [u32; 3],
    global_size: [u32; 3],
    block_size: [u32; 3],
}

impl ThreadIds {
    fn linear(&self) -> u32 {
        let [x, y, z] = self.global;
        let [w, h, _] = self.global_size;
        x.wrapping_add(y.wrapping_mul(w))
            .wrapping_add(z.wrapping_mul(w.wrapping_mul(h)))
    }
}

struct Thread<'k, 'b> {
    kernel: &'k CompiledKernel,
    bindings: &'k Bindings<'b>,
    ids: ThreadIds,
    locals: Vec<ScalarValue>,
}

fn split(index: u64, extent: [u32; 3]) -> [u32; 3] {
    let x = index % extent[0] as u64;
    let rest = index / extent[0] as u64;
    let y = rest % extent[1] as u64;
    let z = rest / extent[1] as u64;
    [x as u32, y as u32, z as u32]
}

/// Run every thread of block `block_index`, one after another.
pub fn run_block(
    kernel: &CompiledKernel,
    bindings: &Bindings<'_>,
    shape: &LaunchShape,
    block_index: u64,
) -> Run<()> {
    let block = split(block_index, shape.grid);
    let mut ids = ThreadIds {
        block,
        block_size: shape.block,
        global_size: [
            shape.grid[0].saturating_mul(shape.block[0]),
            shape.grid[1].saturating_mul(shape.block[1]),
            shape.grid[2].saturating_mul(shape.block[2]),
        ],
        ..Default::default()
    };

    let mut thread = Thread {
        kernel,
        bindings,
        ids,
        locals: vec![ScalarValue::U32(0); kernel.local_count],
    };

    for t in 0..shape.threads_per_block() {
        let local = split(t, shape.block);
        for axis in 0..3 {
            ids.local[axis] = local[axis];
            ids.global[axis] = block[axis]
                .wrapping_mul(shape.block[axis])
                .wrapping_add(local[axis]);
        }
        thread.ids = ids;
        for (param, slot) in &kernel.scalar_slots {
            if let Some(value) = bindings.scalars[*param] {
                thread.locals[*slot] = value;
            }
        }
        thread.block(&kernel.body).map_err(|Fault(msg)| {
            Fault(format!(
                "kernel `{}` thread {:?} of block {:?}: {msg}",
                kernel.name, local, block
            ))
        })?;
    }
    Ok(())
}

impl<'k, 'b> Thread<'k, 'b> {
    fn block(&mut self, stmts: &[IrStmt]) -> Run<()> {
        for stmt in stmts {
            self.stmt(stmt)?;
        }
        Ok(())
    }

    fn stmt(&mut self, stmt: &IrStmt) -> Run<()> {
        match stmt {
            IrStmt::Set(slot, value) => {
                self.locals[*slot] = self.eval(value)?;
            }
            IrStmt::Store {
                param,
                index,
                value,
            } => {
                let index = self.eval(index)?;
                let value = self.eval(value)?;
                let (memory, at) = self.element(*param, index)?;
                memory.store_u32(at, value.to_bits());
            }
            IrStmt::If {
                cond,
                then,
                otherwise,
            } => {
                if self.eval(cond)? == ScalarValue::Bool(true) {
                    self.block(then)?;
                } else {
                    self.block(otherwise)?;
                }
            }
            IrStmt::For {
                var,
                ty,
                start,
                end,
                body,
            } => {
                let start = as_i64(self.eval(start)?);
                let end = as_i64(self.eval(end)?);
                for i in start..end {
                    self.locals[*var] = match ty {
                        ScalarType::U32 => ScalarValue::U32(i as u32),
                        _ => ScalarValue::I32(i as i32),
                    };
                    self.block(body)?;
                }
            }
        }
        Ok(())
    }

    fn element(&self, param: usize, index: ScalarValue) -> Run<(&'b HostMemory, u64)> {
        let view = self.bindings.buffers[param]
            .as_ref()
            .ok_or_else(|| Fault(format!("parameter {param} is not bound to a buffer")))?;
        let i = as_i64(index);
        if i < 0 || i >= view.len as i64 {
            return Err(Fault(format!(
                "index {i} out of bounds for buffer of {} elements",
                view.len
            )));
        }
        Ok((view.memory, view.offset + i as u64 * ELEMENT_BYTES))
    }

    fn builtin(&self, b: Builtin) -> u32 {
        match b {
            Builtin::GlobalLinear => self.ids.linear(),
            Builtin::Global(a) => self.ids.global[a.index()],
            Builtin::Local(a) => self.ids.local[a.index()],
            Builtin::Block(a) => self.ids.block[a.index()],
            Builtin::GlobalSize(a) => self.ids.global_size[a.index()],
            Builtin::BlockSize(a) => self.ids.block_size[a.index()],
        }
    }

    fn eval(&self, ir: &Ir) -> Run<ScalarValue> {
        Ok(match ir {
            Ir::Const(v) => *v,
            Ir::Local(slot) => self.locals[*slot],
            Ir::Builtin(b) => ScalarValue::U32(self.builtin(*b)),
            Ir::Load { param, index } => {
                let index = self.eval(index)?;
                let (memory, at) = self.element(*param, index)?;
                let bits = memory.load_u32(at);
                match self.kernel.elements[*param] {
                    Some(ScalarType::F32) => ScalarValue::F32(f32::from_bits(bits)),
                    Some(ScalarType::I32) => ScalarValue::I32(bits as i32),
                    _ => ScalarValue::U32(bits),
                }
            }
            Ir::Len(param) => ScalarValue::U32(
                self.bindings.buffers[*param]
                    .as_ref()
                    .map(|v| v.len)
                    .unwrap_or(0),
            ),
            Ir::Unary(op, inner) => unary(*op, self.eval(inner)?),
            Ir::Binary(BinOp::And, l, r) => {
                ScalarValue::Bool(truthy(self.eval(l)?) && truthy(self.eval(r)?))
            }
            Ir::Binary(BinOp::Or, l, r) => {
                ScalarValue::Bool(truthy(self.eval(l)?) || truthy(self.eval(r)?))
            }
            Ir::Binary(op, l, r) => binary(*op, self.eval(l)?, self.eval(r)?)?,
            Ir::Call(f, args) => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg)?);
                }
                intrinsic(*f, &values)
            }
            Ir::Cast(ty, inner) => cast(*ty, self.eval(inner)?),
        })
    }
}

fn truthy(v: ScalarValue) -> bool {
    v == ScalarValue::Bool(true)
}

fn as_i64(v: ScalarValue) -> i64 {
    match v {
        ScalarValue::I32(v) => v as i64,
        ScalarValue::U32(v) => v as i64,
        ScalarValue::F32(v) => v as i64,
        ScalarValue::Bool(v) => v as i64,
    }
}

fn unary(op: UnOp, v: ScalarValue) -> ScalarValue {
    match (op, v) {
        (UnOp::Neg, ScalarValue::I32(v)) => ScalarValue::I32(v.wrapping_neg()),
        (UnOp::Neg, ScalarValue::F32(v)) => ScalarValue::F32(-v),
        (UnOp::Not, ScalarValue::Bool(v)) => ScalarValue::Bool(!v),
        (_, v) => v,
    }
}

macro_rules! int_arith {
    ($op:expr, $a:expr, $b:expr, $variant:path) => {
        match $op {
            BinOp::Add => $variant($a.wrapping_add($b)),
            BinOp::Sub => $variant($a.wrapping_sub($b)),
            BinOp::Mul => $variant($a.wrapping_mul($b)),
            BinOp::Div | BinOp::Rem if $b == 0 => {
                return Err(Fault("integer division by zero".into()))
            }
            BinOp::Div => $variant($a.wrapping_div($b)),
            BinOp::Rem => $variant($a.wrapping_rem($b)),
            _ => compare($op, $a.partial_cmp(&$b)),
        }
    };
}

fn compare(op: BinOp, ord: Option<std::cmp::Ordering>) -> ScalarValue {
    use std::cmp::Ordering::*;
    ScalarValue::Bool(match (op, ord) {
        (_, None) => op == BinOp::Ne,
        (BinOp::Lt, Some(o)) => o == Less,
        (BinOp::Le, Some(o)) => o != Greater,
        (BinOp::Gt, Some(o)) => o == Greater,
        (BinOp::Ge, Some(o)) => o != Less,
        (BinOp::Eq, Some(o)) => o == Equal,
        (BinOp::Ne, Some(o)) => o != Equal,
        _ => false,
    })
}

fn binary(op: BinOp, l: ScalarValue, r: ScalarValue) -> Run<ScalarValue> {
    Ok(match (l, r) {
        (ScalarValue::I32(a), ScalarValue::I32(b)) => int_arith!(op, a, b, ScalarValue::I32),
        (ScalarValue::U32(a), ScalarValue::U32(b)) => int_arith!(op, a, b, ScalarValue::U32),
        (ScalarValue::F32(a), ScalarValue::F32(b)) => match op {
            BinOp::Add => ScalarValue::F32(a + b),
            BinOp::Sub => ScalarValue::F32(a - b),
            BinOp::Mul => ScalarValue::F32(a * b),
            BinOp::Div => ScalarValue::F32(a / b),
            BinOp::Rem => ScalarValue::F32(a % b),
            _ => compare(op, a.partial_cmp(&b)),
        },
        (ScalarValue::Bool(a), ScalarValue::Bool(b)) => compare(op, Some(a.cmp(&b))),
        (l, r) => {
            return Err(Fault(format!(
                "operands of `{}` disagree: {l:?} and {r:?}",
                op.symbol()
            )))
        }
    })
}

fn intrinsic(f: Intrinsic, args: &[ScalarValue]) -> ScalarValue {
    match (f, args) {
        (Intrinsic::Min, [ScalarValue::F32(a), ScalarValue::F32(b)]) => ScalarValue::F32(a.min(*b)),
        (Intrinsic::Min, [ScalarValue::I32(a), ScalarValue::I32(b)]) => ScalarValue::I32(*a.min(b)),
        (Intrinsic::Min, [ScalarValue::U32(a), ScalarValue::U32(b)]) => ScalarValue::U32(*a.min(b)),
        (Intrinsic::Max, [ScalarValue::F32(a), ScalarValue::F32(b)]) => ScalarValue::F32(a.max(*b)),
        (Intrinsic::Max, [ScalarValue::I32(a), ScalarValue::I32(b)]) => ScalarValue::I32(*a.max(b)),
        (Intrinsic::Max, [ScalarValue::U32(a), ScalarValue::U32(b)]) => ScalarValue::U32(*a.max(b)),
        (Intrinsic::Abs, [ScalarValue::F32(a)]) => ScalarValue::F32(a.abs()),
        (Intrinsic::Abs, [ScalarValue::I32(a)]) => ScalarValue::I32(a.wrapping_abs()),
        (Intrinsic::Sqrt, [ScalarValue::F32(a)]) => ScalarValue::F32(a.sqrt()),
        (_, [first, ..]) => *first,
        (_, []) => ScalarValue::U32(0),
    }
}

fn cast(ty: ScalarType, v: ScalarValue) -> ScalarValue {
    let f = match v {
        ScalarValue::F32(v) => v as f64,
        ScalarValue::I32(v) => v as f64,
        ScalarValue::U32(v) => v as f64,
        ScalarValue::Bool(v) => v as u8 as f64,
    };
    match (ty, v) {
        (ScalarType::I32, ScalarValue::U32(v)) => ScalarValue::I32(v as i32),
        (ScalarType::U32, ScalarValue::I32(v)) => ScalarValue::U32(v as u32),
        (ScalarType::F32, _) => ScalarValue::F32(f as f32),
        (ScalarType::I32, _) => ScalarValue::I32(f as i32),
        (ScalarType::U32, _) => ScalarValue::U32(f as u32),
        (ScalarType::Bool, _) => ScalarValue::Bool(f != 0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::cpu::compiler::compile;
    use crate::gpu::cpu::lexer::lex;
    use crate::gpu::cpu::parser::parse;
    use crate::gpu::driver::NativeBuffer;
    use crate::gpu::structs::Residency;

    fn kernel(src: &str) -> CompiledKernel {
        let tokens = lex(src).unwrap();
        let program = parse(src, &tokens).unwrap();
        compile(&program).unwrap().remove(0)
    }

    fn memory_with(values: &[u32]) -> HostMemory {
        let mem = HostMemory::new(values.len() as u64 * 4, Residency::HostVisible);
        mem.write(0, bytemuck::cast_slice(values)).unwrap();
        mem
    }

    fn contents(mem: &HostMemory) -> Vec<u32> {
        let mut out = vec![0u8; mem.size() as usize];
        mem.read(0, &mut out).unwrap();
        bytemuck::pod_collect_to_vec(&out)
    }

    fn run(k: &CompiledKernel, bindings: &Bindings<'_>, shape: LaunchShape) -> Run<()> {
        (0..shape.block_count()).try_for_each(|b| run_block(k, bindings, &shape, b))
    }

    #[test]
    fn runs_every_thread_of_the_grid() {
        let k = kernel("kernel fill(o: buffer<u32>) { if gid < len(o) { o[gid] = gid * 10u; } }");
        let mem = memory_with(&[0; 6]);
        let bindings = Bindings {
            buffers: vec![Some(BufferView {
                memory: &mem,
                offset: 0,
                len: 6,
            })],
            scalars: vec![None],
        };
        run(&k, &bindings, LaunchShape::linear(6, 4)).unwrap();
        assert_eq!(contents(&mem), vec![0, 10, 20, 30, 40, 50]);
    }

    #[test]
    fn loops_and_scalars() {
        let k = kernel(
            "kernel sum(o: buffer<i32>, n: i32) {\n\
             let acc = 0;\n\
             for i in 0..n { if i % 2 == 0 { acc = acc + i; } else { acc = acc - 1; } }\n\
             o[0] = acc;\n\
             }",
        );
        let mem = memory_with(&[0]);
        let bindings = Bindings {
            buffers: vec![
                Some(BufferView {
                    memory: &mem,
                    offset: 0,
                    len: 1,
                }),
                None,
            ],
            scalars: vec![None, Some(ScalarValue::I32(5))],
        };
        run(&k, &bindings, LaunchShape::linear(1, 1)).unwrap();
        // 0 - 1 + 2 - 1 + 4
        assert_eq!(contents(&mem), vec![4]);
    }

    #[test]
    fn out_of_bounds_store_faults() {
        let k = kernel("kernel k(o: buffer<u32>) { o[gid] = 1u; }");
        let mem = memory_with(&[0; 2]);
        let bindings = Bindings {
            buffers: vec![Some(BufferView {
                memory: &mem,
                offset: 0,
                len: 2,
            })],
            scalars: vec![None],
        };
        let Fault(msg) = run(&k, &bindings, LaunchShape::linear(3, 4)).unwrap_err();
        assert!(msg.contains("kernel `k`"), "{msg}");
        assert!(msg.contains("index 2 out of bounds"), "{msg}");
    }

    #[test]
    fn integer_division_by_zero_faults() {
        let k = kernel("kernel k(o: buffer<i32>, d: i32) { o[0] = 7 / d; }");
        let mem = memory_with(&[0]);
        let bindings = Bindings {
            buffers: vec![
                Some(BufferView {
                    memory: &mem,
                    offset: 0,
                    len: 1,
                }),
                None,
            ],
            scalars: vec![None, Some(ScalarValue::I32(0))],
        };
        let Fault(msg) = run(&k, &bindings, LaunchShape::linear(1, 1)).unwrap_err();
        assert!(msg.ends_with("integer division by zero"), "{msg}");
    }

    #[test]
    fn float_math_and_casts() {
        assert_eq!(
            cast(ScalarType::I32, ScalarValue::F32(-2.7)),
            ScalarValue::I32(-2)
        );
        assert_eq!(
            binary(BinOp::Lt, ScalarValue::F32(f32::NAN), ScalarValue::F32(1.0)).unwrap(),
            ScalarValue::Bool(false)
        );
        assert_eq!(
            intrinsic(Intrinsic::Sqrt, &[ScalarValue::F32(9.0)]),
            ScalarValue::F32(3.0)
        );
    }
}
