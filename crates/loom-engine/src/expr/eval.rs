use std::cell::Cell;
use std::collections::HashMap;

use super::builtins;
use super::parser::{BinOp, CmpOp, Expr, UnaryOp};
use super::value::{Num, Value};
use super::ExprError;

/// Longest list, tuple or string that `*` may produce.
const MAX_REPEAT_LEN: usize = 1_000_000;

/// Total [`Value::weight`] one evaluation may build, summed over every
/// copied, concatenated or constructed value.
pub const MAX_ALLOCATION: usize = 4_000_000;

/// Tree-walking evaluator over a read-only variable map.
pub(crate) struct Evaluator<'a> {
    vars: &'a HashMap<String, serde_json::Value>,
    allocated: Cell<usize>,
}

impl<'a> Evaluator<'a> {
    pub(crate) fn new(vars: &'a HashMap<String, serde_json::Value>) -> Self {
        Self {
            vars,
            allocated: Cell::new(0),
        }
    }

    fn charge(&self, weight: usize) -> Result<(), ExprError> {
        let total = self.allocated.get().saturating_add(weight);
        if total > MAX_ALLOCATION {
            return Err(ExprError::Value(format!(
                "expression allocates too much (limit {})",
                MAX_ALLOCATION
            )));
        }
        self.allocated.set(total);
        Ok(())
    }

    fn charged(&self, value: Value) -> Result<Value, ExprError> {
        self.charge(value.weight())?;
        Ok(value)
    }

    pub(crate) fn eval(&self, expr: &Expr) -> Result<Value, ExprError> {
        match expr {
            Expr::Const(v) => self.charged(v.clone()),
            Expr::Name(name) => self.charged(self.lookup(name)?),
            // Elements were charged as they were built; only the container is new.
            Expr::List(items) => {
                self.charge(1 + items.len())?;
                Ok(Value::List(self.eval_all(items)?))
            }
            Expr::Tuple(items) => {
                self.charge(1 + items.len())?;
                Ok(Value::Tuple(self.eval_all(items)?))
            }
            Expr::Set(items) => {
                self.charge(1 + items.len())?;
                builtins::make_set(self.eval_all(items)?)
            }
            Expr::Dict(pairs) => {
                self.charge(1 + pairs.len())?;
                let mut entries = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    entries.push((self.eval(k)?, self.eval(v)?));
                }
                builtins::make_dict(entries)
            }
            Expr::Unary { op, operand } => unary(*op, self.eval(operand)?),
            Expr::Binary { op, left, right } => {
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                self.charge(sequence_weight(*op, &l, &r))?;
                binary(*op, &l, &r)
            }
            Expr::And(left, right) => {
                let l = self.eval(left)?;
                if !l.truthy() {
                    return Ok(l);
                }
                self.eval(right)
            }
            Expr::Or(left, right) => {
                let l = self.eval(left)?;
                if l.truthy() {
                    return Ok(l);
                }
                self.eval(right)
            }
            Expr::Compare { left, rest } => {
                let mut current = self.eval(left)?;
                for (op, next) in rest {
                    let rhs = self.eval(next)?;
                    if !compare(*op, &current, &rhs)? {
                        return Ok(Value::Bool(false));
                    }
                    current = rhs;
                }
                Ok(Value::Bool(true))
            }
            Expr::IfElse {
                cond,
                then,
                otherwise,
            } => {
                if self.eval(cond)?.truthy() {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
            Expr::Attribute { value, attr } => {
                check_attribute(attr)?;
                let target = self.eval(value)?;
                if builtins::has_method(&target, attr) {
                    Err(ExprError::Type(format!(
                        "method '{}' of '{}' must be called",
                        attr,
                        target.type_name()
                    )))
                } else {
                    Err(ExprError::AttributeNotFound {
                        type_name: target.type_name().to_string(),
                        attr: attr.clone(),
                    })
                }
            }
            Expr::Subscript { value, index } => {
                let target = self.eval(value)?;
                let key = self.eval(index)?;
                self.charged(subscript(&target, &key)?)
            }
            Expr::Call { func, args } => {
                let result = self.call(func, args)?;
                self.charged(result)
            }
        }
    }

    fn eval_all(&self, items: &[Expr]) -> Result<Vec<Value>, ExprError> {
        items.iter().map(|e| self.eval(e)).collect()
    }

    fn lookup(&self, name: &str) -> Result<Value, ExprError> {
        if let Some(value) = self.vars.get(name) {
            return Ok(Value::from_json(value));
        }
        if builtins::is_builtin(name) {
            return Err(ExprError::Type(format!(
                "builtin '{}' can only be called",
                name
            )));
        }
        Err(ExprError::UndefinedName(name.to_string()))
    }

    fn call(&self, func: &Expr, args: &[Expr]) -> Result<Value, ExprError> {
        match func {
            Expr::Name(name) => {
                if let Some(value) = self.vars.get(name) {
                    return Err(not_callable(&Value::from_json(value)));
                }
                if !builtins::is_builtin(name) {
                    return Err(ExprError::UndefinedName(name.clone()));
                }
                builtins::call(name, self.eval_all(args)?)
            }
            Expr::Attribute { value, attr } => {
                check_attribute(attr)?;
                let receiver = self.eval(value)?;
                builtins::call_method(&receiver, attr, self.eval_all(args)?)
            }
            other => Err(not_callable(&self.eval(other)?)),
        }
    }
}

fn check_attribute(attr: &str) -> Result<(), ExprError> {
    if attr.starts_with('_') {
        return Err(ExprError::PrivateAttribute(attr.to_string()));
    }
    Ok(())
}

fn not_callable(value: &Value) -> ExprError {
    ExprError::Type(format!("'{}' object is not callable", value.type_name()))
}

fn unary(op: UnaryOp, operand: Value) -> Result<Value, ExprError> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!operand.truthy())),
        UnaryOp::Pos | UnaryOp::Neg => {
            let symbol = if op == UnaryOp::Neg { "-" } else { "+" };
            let n = operand.as_num().ok_or_else(|| {
                ExprError::Type(format!(
                    "bad operand type for unary {}: '{}'",
                    symbol,
                    operand.type_name()
                ))
            })?;
            Ok(match (op, n) {
                (UnaryOp::Neg, Num::I(i)) => Value::Int(i.checked_neg().ok_or(ExprError::Overflow)?),
                (UnaryOp::Neg, Num::F(f)) => Value::Float(-f),
                (_, Num::I(i)) => Value::Int(i),
                (_, Num::F(f)) => Value::Float(f),
            })
        }
    }
}

fn unsupported_operands(op: BinOp, l: &Value, r: &Value) -> ExprError {
    ExprError::Type(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op.symbol(),
        l.type_name(),
        r.type_name()
    ))
}

/// Weight a sequence `+` or `*` would build, checked before building it.
fn sequence_weight(op: BinOp, l: &Value, r: &Value) -> usize {
    match (op, l, r) {
        (BinOp::Add, Value::Str(_), Value::Str(_))
        | (BinOp::Add, Value::List(_), Value::List(_))
        | (BinOp::Add, Value::Tuple(_), Value::Tuple(_)) => l.weight().saturating_add(r.weight()),
        (BinOp::Mul, seq @ (Value::Str(_) | Value::List(_) | Value::Tuple(_)), n)
        | (BinOp::Mul, n, seq @ (Value::Str(_) | Value::List(_) | Value::Tuple(_))) => {
            match n.as_index() {
                Some(times) => (seq.weight() - 1)
                    .saturating_mul(times.max(0) as usize)
                    .saturating_add(1),
                None => 0,
            }
        }
        _ => 0,
    }
}

/// Python arithmetic on sandbox values. Integer overflow is an error, not a wrap.
pub(crate) fn binary(op: BinOp, l: &Value, r: &Value) -> Result<Value, ExprError> {
    if let (Some(a), Some(b)) = (l.as_num(), r.as_num()) {
        return numeric(op, a, b);
    }

    match (op, l, r) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{}{}", a, b))),
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            Ok(Value::List(a.iter().chain(b.iter()).cloned().collect()))
        }
        (BinOp::Add, Value::Tuple(a), Value::Tuple(b)) => {
            Ok(Value::Tuple(a.iter().chain(b.iter()).cloned().collect()))
        }
        (BinOp::Mul, seq, n) | (BinOp::Mul, n, seq)
            if n.as_index().is_some() && matches!(seq, Value::Str(_) | Value::List(_) | Value::Tuple(_)) =>
        {
            repeat(seq, n.as_index().unwrap_or(0))
        }
        _ => Err(unsupported_operands(op, l, r)),
    }
}

fn repeat(seq: &Value, times: i64) -> Result<Value, ExprError> {
    let times = times.max(0) as usize;
    let len = match seq {
        Value::Str(s) => s.chars().count(),
        Value::List(v) | Value::Tuple(v) => v.len(),
        _ => 0,
    };
    if len.saturating_mul(times) > MAX_REPEAT_LEN {
        return Err(ExprError::Value("repetition result too large".to_string()));
    }
    Ok(match seq {
        Value::Str(s) => Value::Str(s.repeat(times)),
        Value::List(v) => Value::List(repeat_items(v, times)),
        Value::Tuple(v) => Value::Tuple(repeat_items(v, times)),
        other => other.clone(),
    })
}

fn repeat_items(items: &[Value], times: usize) -> Vec<Value> {
    let mut out = Vec::with_capacity(items.len() * times);
    for _ in 0..times {
        out.extend_from_slice(items);
    }
    out
}

fn numeric(op: BinOp, a: Num, b: Num) -> Result<Value, ExprError> {
    if let (Num::I(x), Num::I(y)) = (a, b) {
        return int_op(op, x, y);
    }
    let (x, y) = (a.as_f64(), b.as_f64());
    let result = match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => {
            if y == 0.0 {
                return Err(ExprError::ZeroDivision("float division by zero".to_string()));
            }
            x / y
        }
        BinOp::FloorDiv => {
            if y == 0.0 {
                return Err(ExprError::ZeroDivision("float floor division by zero".to_string()));
            }
            (x / y).floor()
        }
        BinOp::Mod => {
            if y == 0.0 {
                return Err(ExprError::ZeroDivision("float modulo".to_string()));
            }
            let r = x % y;
            if r != 0.0 && (r < 0.0) != (y < 0.0) {
                r + y
            } else {
                r
            }
        }
        BinOp::Pow => {
            if x == 0.0 && y < 0.0 {
                return Err(ExprError::ZeroDivision(
                    "0.0 cannot be raised to a negative power".to_string(),
                ));
            }
            let r = x.powf(y);
            if r.is_nan() && !x.is_nan() && !y.is_nan() {
                return Err(ExprError::Value("math domain error".to_string()));
            }
            r
        }
    };
    Ok(Value::Float(result))
}

fn int_op(op: BinOp, x: i64, y: i64) -> Result<Value, ExprError> {
    let checked = |v: Option<i64>| v.map(Value::Int).ok_or(ExprError::Overflow);
    match op {
        BinOp::Add => checked(x.checked_add(y)),
        BinOp::Sub => checked(x.checked_sub(y)),
        BinOp::Mul => checked(x.checked_mul(y)),
        BinOp::Div => {
            if y == 0 {
                return Err(ExprError::ZeroDivision("division by zero".to_string()));
            }
            Ok(Value::Float(x as f64 / y as f64))
        }
        BinOp::FloorDiv => {
            if y == 0 {
                return Err(ExprError::ZeroDivision(
                    "integer division or modulo by zero".to_string(),
                ));
            }
            let q = x.checked_div(y).ok_or(ExprError::Overflow)?;
            let floored = if (x % y != 0) && ((x < 0) != (y < 0)) { q - 1 } else { q };
            Ok(Value::Int(floored))
        }
        BinOp::Mod => {
            if y == 0 {
                return Err(ExprError::ZeroDivision(
                    "integer division or modulo by zero".to_string(),
                ));
            }
            let r = x.checked_rem(y).ok_or(ExprError::Overflow)?;
            Ok(Value::Int(if r != 0 && ((r < 0) != (y < 0)) { r + y } else { r }))
        }
        BinOp::Pow => {
            if y < 0 {
                if x == 0 {
                    return Err(ExprError::ZeroDivision(
                        "0 cannot be raised to a negative power".to_string(),
                    ));
                }
                return Ok(Value::Float((x as f64).powf(y as f64)));
            }
            let exp = u32::try_from(y).map_err(|_| ExprError::Overflow)?;
            checked(x.checked_pow(exp))
        }
    }
}

fn compare(op: CmpOp, l: &Value, r: &Value) -> Result<bool, ExprError> {
    use std::cmp::Ordering::*;
    Ok(match op {
        CmpOp::Eq => l == r,
        CmpOp::NotEq => l != r,
        CmpOp::Lt => l.ordering(r, op.symbol())? == Some(Less),
        CmpOp::Le => matches!(l.ordering(r, op.symbol())?, Some(Less | Equal)),
        CmpOp::Gt => l.ordering(r, op.symbol())? == Some(Greater),
        CmpOp::Ge => matches!(l.ordering(r, op.symbol())?, Some(Greater | Equal)),
        CmpOp::In => contains(r, l)?,
        CmpOp::NotIn => !contains(r, l)?,
        CmpOp::Is => l.is_same(r),
        CmpOp::IsNot => !l.is_same(r),
    })
}

fn contains(container: &Value, item: &Value) -> Result<bool, ExprError> {
    match container {
        Value::Str(haystack) => match item {
            Value::Str(needle) => Ok(haystack.contains(needle.as_str())),
            other => Err(ExprError::Type(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::List(items) | Value::Tuple(items) | Value::Set(items) => {
            Ok(items.iter().any(|v| v == item))
        }
        Value::Dict(_) => Ok(container.dict_get(item).is_some()),
        other => Err(ExprError::Type(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

fn subscript(target: &Value, key: &Value) -> Result<Value, ExprError> {
    match target {
        Value::List(items) | Value::Tuple(items) => {
            let idx = key.as_index().ok_or_else(|| {
                ExprError::Type(format!(
                    "{} indices must be integers, not {}",
                    target.type_name(),
                    key.type_name()
                ))
            })?;
            resolve_index(idx, items.len())
                .map(|i| items[i].clone())
                .ok_or_else(|| {
                    ExprError::IndexOutOfRange(format!("{} index {}", target.type_name(), idx))
                })
        }
        Value::Str(s) => {
            let idx = key.as_index().ok_or_else(|| {
                ExprError::Type(format!("string indices must be integers, not {}", key.type_name()))
            })?;
            let chars: Vec<char> = s.chars().collect();
            resolve_index(idx, chars.len())
                .map(|i| Value::Str(chars[i].to_string()))
                .ok_or_else(|| ExprError::IndexOutOfRange(format!("string index {}", idx)))
        }
        Value::Dict(_) => {
            if !key.is_hashable() {
                return Err(ExprError::Type(format!(
                    "unhashable type: '{}'",
                    key.type_name()
                )));
            }
            target
                .dict_get(key)
                .cloned()
                .ok_or_else(|| ExprError::KeyNotFound(key.repr()))
        }
        other => Err(ExprError::Type(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

fn resolve_index(idx: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let resolved = if idx < 0 { idx + len } else { idx };
    (0..len).contains(&resolved).then_some(resolved as usize)
}
